//! A sequenced controller for a sandboxed content-rendering worker.
//!
//! A [`Reverie`] instance owns one worker process and drives it through
//! a strictly sequential action queue: fluent methods enqueue, and
//! [`Reverie::run`] drains the queue in order, settling with the last
//! action's value or the first failure. The worker is launched lazily
//! by the first run, initialized through a ready handshake, and torn
//! down on [`Reverie::end`], [`Reverie::halt`], or a process signal.
//!
//! ```no_run
//! use reverie::{Config, Reverie};
//!
//! # async fn demo() -> Result<(), reverie::ControlError> {
//! let rev = Reverie::new(Config::default());
//! let title = rev
//!     .goto("https://example.com")
//!     .wait_for_selector("h1")
//!     .title()
//!     .end()
//!     .run()
//!     .await?;
//! println!("{title}");
//! # Ok(())
//! # }
//! ```

mod actions;
mod config;
mod controller;
mod error;
mod script;
mod supervisor;
mod wait;

pub use actions::InjectKind;
pub use config::Config;
pub use controller::{Reverie, State};
pub use error::{ControlError, DEFAULT_HALT_MESSAGE};
pub use supervisor::{LaunchFuture, LaunchedWorker, ProcessLauncher, WorkerLauncher};

pub use reverie_ipc::{IpcChannel, IpcError, RemoteError};
