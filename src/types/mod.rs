pub mod job;
pub(crate) mod protocol;
pub(crate) mod serialisable;
