mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use beanpool::util::bytes_to_human_str;
use beanpool::{Pool, PutOptions};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use crate::args::{Args, Cmd};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    if let Err(error) = run(args).await {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(args: Args) -> Result<()> {
    let mut pool = Pool::connect(args.server).await;
    if pool.open_count() == 0 {
        bail!("no servers reachable: {:?}", pool.addrs());
    }

    match args.cmd {
        Cmd::Stats => {
            let stats = pool.stats().await?;
            print!("{}", serde_yaml::to_string(&stats)?);
        },
        Cmd::Put {
            body,
            tube,
            pri,
            delay,
            ttr,
        } => {
            if let Some(tube) = tube {
                pool.use_tube(&tube).await?;
            }
            let id = pool
                .put(body.into_bytes(), PutOptions { pri, delay, ttr })
                .await?;
            info!(id, "job enqueued");
        },
        Cmd::Reserve {
            watch,
            timeout,
            delete,
        } => {
            for tube in &watch {
                pool.watch(tube).await?;
            }

            let cancel = CancellationToken::new();
            if let Some(secs) = timeout {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    cancel.cancel();
                });
            }

            let job = pool.reserve_with(&cancel).await?;
            println!(
                "{} {}",
                job.id(),
                bytes_to_human_str(job.body())
            );

            if delete {
                job.delete().await?;
            }
        },
        Cmd::Peek => match pool.peek().await? {
            Some(job) => println!(
                "{} {}",
                job.id(),
                bytes_to_human_str(job.body())
            ),
            None => info!("no ready jobs"),
        },
        Cmd::Delete { id } => {
            let found = pool.peek_job(id).await?;
            if found.is_empty() {
                bail!("job {id} not found on any server");
            }
            for (addr, job) in found {
                job.delete().await?;
                info!(id, addr, "job deleted");
            }
        },
        Cmd::ListTubes => {
            for (addr, tubes) in pool.list_tubes().await? {
                println!("{addr}: {}", tubes.join(", "));
            }
        },
    }

    Ok(())
}
