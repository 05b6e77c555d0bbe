//! HTTP client for InfluxDB 1.x.
//!
//! Writes go out as line protocol, queries come back as [`Results`]. Requests
//! are spread over every configured host; a host that fails is quarantined
//! with exponential backoff and the request is retried elsewhere.
//!
//! ```no_run
//! use std::time::Duration;
//! use influx_client::{Client, ClientConfig, Point, QueryOptions, WriteOptions};
//!
//! # async fn run() -> influx_client::Result<()> {
//! let client = Client::new(ClientConfig::new("http://localhost:8086/telemetry")?)?;
//! client
//!     .write_points(&[Point::new("cpu").tag("host", "a").field("load", 0.42)], &WriteOptions::new())
//!     .await?;
//! let rows = client.query("select * from cpu", &QueryOptions::new()).await?;
//! for status in client.ping(Duration::from_secs(5)).await {
//!     println!("{} online={}", status.url, status.online);
//! }
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod escape;
pub mod host;
pub mod line_protocol;
pub mod pool;
pub mod results;
pub mod schema;
pub mod time;
pub mod transport;

pub use admin::{Privilege, RetentionPolicy, SeriesFilter};
pub use backoff::{BackoffStrategy, ExponentialBackoff, ExponentialOptions};
pub use client::{Client, QueryOptions, WriteOptions};
pub use config::{ClientConfig, ConnectionTarget, HostConfig, PoolOptions, Protocol};
pub use error::{Error, Result};
pub use host::HostOptions;
pub use line_protocol::{FieldValue, Point};
pub use pool::{PingStatus, Pool};
pub use results::{QueryOutput, Results, Row};
pub use schema::{FieldType, SchemaDefinition};
pub use time::{NanoDate, Precision, Timestamp};
pub use transport::{FakeTransport, ReqwestTransport, Transport};
