//! Concrete browser drivers.

mod chromium;
mod script;

pub use chromium::ChromiumSessions;
