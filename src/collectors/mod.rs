//! Collectors take a point-in-time snapshot of one part of the system
//!
//! Collectors are passed into each coordinator call; there is no registry.

use anyhow::Result;
use std::collections::BTreeSet;

use crate::cancel::CancellationToken;
use crate::models::{CollectObject, ResultType};

pub mod file;
pub mod process;

pub use file::FileCollector;
pub use process::ProcessCollector;

pub trait Collector: Send {
    fn name(&self) -> &str;

    /// Categories this collector emits
    fn result_types(&self) -> BTreeSet<ResultType>;

    /// Emit every object into `sink`. Implementations check `token` between
    /// items and return early once it is cancelled.
    fn start_run(&mut self, token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> Result<()>;

    /// Release resources held for the run
    fn stop_run(&mut self) {}
}
