#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        sync::atomic::{fence, AtomicBool, AtomicU32, AtomicUsize, Ordering},
        thread::yield_now,
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicUsize, Ordering};
    pub(crate) use std::thread::yield_now;
}

pub(crate) use imp::*;
