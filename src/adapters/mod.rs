//! Adapters for the systems the operator drives.
//!
//! Each concern sits behind a trait so the operator can be wired to local
//! implementations or to test doubles.

pub mod artifact;
pub mod bus;
pub mod credentials;
pub mod process;

pub use artifact::{DirectoryInstaller, Downloader, Installer, LocalDownloader};
pub use bus::{EventBus, HandlerFuture, LocalBus, StateChangeHandler};
pub use credentials::{CredentialIssuer, Credentials, TokenIssuer};
pub use process::{
    LaunchRequest, OsLauncher, ProcessError, ProcessInfo, ProcessLauncher, ENV_ADDRESS,
    ENV_PROGRAM_ID, ENV_TOKEN,
};
