//! Leveled logging shims.
//!
//! Forward to `defmt` when the `defmt-03` feature is active and compile to
//! nothing otherwise, so the driver builds identically with and without a
//! logger attached. Logging is diagnostics only, never load-bearing.

#![allow(unused_macros)]

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::trace!($s $(, $x)*);
        #[cfg(not(feature = "defmt-03"))]
        { let _ = ($( & $x ),*); }
    }};
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::debug!($s $(, $x)*);
        #[cfg(not(feature = "defmt-03"))]
        { let _ = ($( & $x ),*); }
    }};
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::info!($s $(, $x)*);
        #[cfg(not(feature = "defmt-03"))]
        { let _ = ($( & $x ),*); }
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::warn!($s $(, $x)*);
        #[cfg(not(feature = "defmt-03"))]
        { let _ = ($( & $x ),*); }
    }};
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt::error!($s $(, $x)*);
        #[cfg(not(feature = "defmt-03"))]
        { let _ = ($( & $x ),*); }
    }};
}
