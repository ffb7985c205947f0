//! Per-queue scheduler: the driver loop and the one-task executor

mod driver;
mod executor;

pub(crate) use driver::run;
