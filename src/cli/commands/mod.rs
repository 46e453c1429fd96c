//! CLI command implementations.

mod cert;
mod init;
mod kv;
mod start;
mod zone;

pub use cert::{run_cert, CertArgs};
pub use init::{run_init, InitArgs};
pub use kv::{run_kv, KvArgs};
pub use start::{run_start, StartArgs};
pub use zone::{run_zone, ZoneArgs};
