use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Server addresses to pool over. Repeatable.
    #[arg(short, long, default_value = "127.0.0.1:11300")]
    pub(crate) server: Vec<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Cmd {
    /// Prints merged statistics across the pool.
    Stats,
    /// Enqueues a job on one server.
    Put {
        body: String,
        /// Tube to put into.
        #[arg(short, long)]
        tube: Option<String>,
        #[arg(short, long, default_value_t = beanpool::DEFAULT_PRI)]
        pri: u32,
        #[arg(short, long, default_value_t = 0)]
        delay: u32,
        /// Time-to-run in seconds.
        #[arg(long, default_value_t = 120)]
        ttr: u32,
    },
    /// Reserves one job and prints it.
    Reserve {
        /// Extra tubes to watch before reserving. Repeatable.
        #[arg(short, long)]
        watch: Vec<String>,
        /// Gives up after this many seconds.
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Deletes the job after printing it.
        #[arg(long, default_value_t)]
        delete: bool,
    },
    /// Prints the next ready job without reserving it.
    Peek,
    /// Deletes a job by ID on whichever server holds it.
    Delete { id: u64 },
    /// Lists the tubes known to each server.
    ListTubes,
}
