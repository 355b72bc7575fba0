//! Logging shims that forward to the `log` crate when the `log` feature is
//! enabled and compile to nothing otherwise.

#![allow(unused_macros)]

macro_rules! trace {
    ($($t:tt)*) => {{
        #[cfg(feature = "log")]
        log::trace!($($t)*);
    }};
}

macro_rules! debug {
    ($($t:tt)*) => {{
        #[cfg(feature = "log")]
        log::debug!($($t)*);
    }};
}

macro_rules! info {
    ($($t:tt)*) => {{
        #[cfg(feature = "log")]
        log::info!($($t)*);
    }};
}

macro_rules! warn {
    ($($t:tt)*) => {{
        #[cfg(feature = "log")]
        log::warn!($($t)*);
    }};
}
