//! Slice dispatchers.
//!
//! A dispatcher receives a prepared [`LaunchDescriptor`] and a per-row runner
//! and returns once every row has run.

use rayon::prelude::*;
use tracing::trace;

use crate::launch::LaunchDescriptor;

pub trait Dispatcher: Send + Sync {
    fn launch(&self, descriptor: &LaunchDescriptor<'_>, run: &(dyn Fn(u64) + Sync));
}

/// Runs rows on the rayon pool when the launch is threadable.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonDispatcher;

impl Dispatcher for RayonDispatcher {
    fn launch(&self, descriptor: &LaunchDescriptor<'_>, run: &(dyn Fn(u64) + Sync)) {
        let slices = descriptor.slice_count();
        if descriptor.threadable && slices > 1 {
            trace!(launch.slices = slices, launch.threads = rayon::current_num_threads(), "parallel launch");
            (0..slices).into_par_iter().for_each(run);
        } else {
            (0..slices).for_each(run);
        }
    }
}

/// Runs every row on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialDispatcher;

impl Dispatcher for SerialDispatcher {
    fn launch(&self, descriptor: &LaunchDescriptor<'_>, run: &(dyn Fn(u64) + Sync)) {
        (0..descriptor.slice_count()).for_each(run);
    }
}
