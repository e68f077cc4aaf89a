//! Bounded browser pool behind a driver seam.
//!
//! The pool logic is generic over [`BrowserDriver`] so tests run against a
//! mock; production uses the chromiumoxide driver.

pub mod driver;
pub mod pool;

pub use driver::{BrowserContext, BrowserDriver, BrowserInstance, ChromiumDriver};
pub use pool::{BrowserPool, BrowserPoolConfig, ContextHandle, PoolStatus};
