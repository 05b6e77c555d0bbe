//! The client facade: writes, queries and pings over the connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::line_protocol::{encode_point, Point};
use crate::pool::{PingStatus, Pool, PoolRequest};
use crate::results::{self, Results};
use crate::schema::Schema;
use crate::time::Precision;
use crate::transport::{ReqwestTransport, Transport};

/// Per-call write settings.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Falls back to the client's database.
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    /// Unit of the timestamps in the written lines.
    pub precision: Precision,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn retention_policy(mut self, rp: impl Into<String>) -> Self {
        self.retention_policy = Some(rp.into());
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

/// Per-call query settings.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Falls back to the client's database.
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    /// Requests integer epoch times in this unit instead of RFC 3339.
    pub precision: Option<Precision>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn retention_policy(mut self, rp: impl Into<String>) -> Self {
        self.retention_policy = Some(rp.into());
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }
}

/// Database client. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Client {
    config: ClientConfig,
    pool: Pool,
    schemas: HashMap<(String, String), Schema>,
}

impl Client {
    /// A client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let pool = Pool::new(config.pool.clone(), transport);
        for endpoint in &config.hosts {
            pool.add_host(endpoint.url.clone(), endpoint.options.clone());
        }

        let schemas = config
            .schemas
            .iter()
            .map(|def| {
                let schema = Schema::new(def.clone());
                (
                    (schema.database().to_string(), schema.measurement().to_string()),
                    schema,
                )
            })
            .collect();

        debug!(hosts = config.hosts.len(), database = ?config.database, "client created");
        Ok(Self {
            config,
            pool,
            schemas,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn schema(&self, database: &str, measurement: &str) -> Option<&Schema> {
        self.schemas
            .get(&(database.to_string(), measurement.to_string()))
    }

    // ------------------------------------------------------------------ //
    //  Writes                                                             //
    // ------------------------------------------------------------------ //

    /// Writes points that each name their own measurement.
    pub async fn write_points(&self, points: &[Point], options: &WriteOptions) -> Result<()> {
        let database = self.database_for(options.database.as_deref())?;
        let mut lines = Vec::with_capacity(points.len());
        for point in points {
            let measurement = point.measurement.as_deref().ok_or_else(|| {
                Error::Validation("point has no measurement".to_string())
            })?;
            let schema = self.schema(&database, measurement);
            lines.push(encode_point(measurement, point, schema, options.precision)?);
        }
        self.send_lines(&database, lines, options).await
    }

    /// Writes points into `measurement`, overriding whatever they name.
    pub async fn write_measurement(
        &self,
        measurement: &str,
        points: &[Point],
        options: &WriteOptions,
    ) -> Result<()> {
        let database = self.database_for(options.database.as_deref())?;
        let schema = self.schema(&database, measurement);
        let lines = points
            .iter()
            .map(|p| encode_point(measurement, p, schema, options.precision))
            .collect::<Result<Vec<_>>>()?;
        self.send_lines(&database, lines, options).await
    }

    async fn send_lines(
        &self,
        database: &str,
        lines: Vec<String>,
        options: &WriteOptions,
    ) -> Result<()> {
        if lines.is_empty() {
            debug!(database, "nothing to write");
            return Ok(());
        }
        debug!(database, points = lines.len(), precision = %options.precision, "writing points");

        let mut request = PoolRequest::post("/write")
            .query("db", database)
            .query("precision", options.precision.as_str())
            .body(lines.join("\n"));
        if let Some(rp) = &options.retention_policy {
            request = request.query("rp", rp.as_str());
        }
        self.pool.discard(&self.authenticate(request)).await
    }

    // ------------------------------------------------------------------ //
    //  Queries                                                            //
    // ------------------------------------------------------------------ //

    /// Runs one statement and returns its rows.
    ///
    /// When `query` holds several `;`-separated statements only the first
    /// statement's results are returned. Use [`Client::query_many`] to get
    /// one [`Results`] per statement.
    pub async fn query(&self, query: &str, options: &QueryOptions) -> Result<Results> {
        let body = self.query_raw(query, options).await?;
        Ok(results::parse_value(body, options.precision)?.into_single())
    }

    /// Runs several statements in one request, one [`Results`] per statement.
    pub async fn query_many<Q: AsRef<str>>(
        &self,
        queries: &[Q],
        options: &QueryOptions,
    ) -> Result<Vec<Results>> {
        let joined = queries
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(";");
        let body = self.query_raw(&joined, options).await?;
        Ok(results::parse_value(body, options.precision)?.into_vec())
    }

    /// Runs `query` and returns the undecoded JSON envelope.
    pub async fn query_raw(&self, query: &str, options: &QueryOptions) -> Result<serde_json::Value> {
        let database = self.database_for(options.database.as_deref())?;
        debug!(database, query, "running query");

        let mut request = PoolRequest::get("/query")
            .query("q", query)
            .query("db", database);
        if let Some(rp) = &options.retention_policy {
            request = request.query("rp", rp.as_str());
        }
        if let Some(precision) = options.precision {
            request = request.query("epoch", precision.as_str());
        }
        self.pool.json(&self.authenticate(request)).await
    }

    /// Pings every configured host.
    pub async fn ping(&self, timeout: Duration) -> Vec<PingStatus> {
        self.pool.ping(timeout).await
    }

    // ------------------------------------------------------------------ //
    //  Helpers                                                            //
    // ------------------------------------------------------------------ //

    /// Runs a statement through `POST /query` and checks the envelope for
    /// errors.
    pub(crate) async fn execute(&self, statement: &str, database: Option<&str>) -> Result<Results> {
        debug!(statement, "executing statement");
        let mut request = PoolRequest::post("/query").query("q", statement);
        if let Some(db) = database {
            request = request.query("db", db);
        }
        let body: serde_json::Value = self.pool.json(&self.authenticate(request)).await?;
        Ok(results::parse_value(body, None)?.into_single())
    }

    /// The explicit database, else the configured one.
    pub(crate) fn database_for(&self, explicit: Option<&str>) -> Result<String> {
        explicit
            .or(self.config.database.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config("no database given and no default database configured".to_string())
            })
    }

    fn authenticate(&self, mut request: PoolRequest) -> PoolRequest {
        if let Some(user) = &self.config.username {
            request = request.query("u", user.as_str());
            if let Some(pass) = &self.config.password {
                request = request.query("p", pass.as_str());
            }
        }
        request
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
