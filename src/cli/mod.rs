pub(crate) mod command;
pub(crate) mod connect;
pub(crate) mod report;
pub(crate) mod scan;
pub(crate) mod ui;

use std::future;

use tokio::signal;
use tokio::time::{self, Instant};
use tracing::warn;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::connect::ConnectArgs;
pub use self::scan::ScanArgs;

use self::report::StopReason;

/// Resolves when `deadline` passes or Ctrl+C is pressed, whichever is first.
pub(crate) async fn stop_signal(deadline: Option<Instant>) -> StopReason {
    let elapsed = async {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    };
    let interrupted = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(?error, "failed to listen for Ctrl+C");
            future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = elapsed => StopReason::Elapsed,
        () = interrupted => StopReason::Interrupted,
    }
}
