pub mod acl;
pub mod camera;
pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod live;
pub mod media;
pub mod motion;
pub mod protocol;
pub mod proxy;
pub mod recording;
pub mod registry;
pub mod server;
pub mod transcode;

pub use config::{NvrConfig, NvrOptions};
pub use error::{NvrError, Result};
pub use registry::Registry;
pub use server::Nvr;
