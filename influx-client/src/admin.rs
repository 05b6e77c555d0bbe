//! Database administration.
//!
//! Every operation is a single InfluxQL statement sent through
//! `POST /query`. Identifiers are double-quoted, passwords single-quoted.

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::error::Result;
use crate::escape::{quoted, string_lit};
use crate::results::Results;

/// Per-database user privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    Read,
    Write,
    All,
}

impl Privilege {
    pub fn as_str(self) -> &'static str {
        match self {
            Privilege::Read  => "READ",
            Privilege::Write => "WRITE",
            Privilege::All   => "ALL",
        }
    }
}

/// Settings for creating or altering a retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Falls back to the client's database.
    pub database: Option<String>,
    /// InfluxQL duration literal, e.g. `7d` or `INF`.
    pub duration: String,
    pub replication: u32,
    pub shard_duration: Option<String>,
    pub is_default: bool,
}

impl RetentionPolicy {
    pub fn new(duration: impl Into<String>) -> Self {
        Self {
            database: None,
            duration: duration.into(),
            replication: 1,
            shard_duration: None,
            is_default: false,
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn replication(mut self, replication: u32) -> Self {
        self.replication = replication;
        self
    }

    pub fn shard_duration(mut self, duration: impl Into<String>) -> Self {
        self.shard_duration = Some(duration.into());
        self
    }

    pub fn default_policy(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// A row of `SHOW RETENTION POLICIES`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub duration: String,
    #[serde(rename = "shardGroupDuration")]
    pub shard_group_duration: String,
    #[serde(rename = "replicaN")]
    pub replica_n: u32,
    pub default: bool,
}

/// A row of `SHOW USERS`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    pub user: String,
    pub admin: bool,
}

/// A row of `SHOW CONTINUOUS QUERIES`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

/// Narrows `SHOW SERIES` and `DROP SERIES`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesFilter {
    pub database: Option<String>,
    pub measurement: Option<String>,
    /// Raw InfluxQL condition, sent verbatim after `WHERE`.
    pub condition: Option<String>,
}

impl SeriesFilter {
    fn clauses(&self) -> String {
        let mut out = String::new();
        if let Some(m) = &self.measurement {
            out.push_str(" from ");
            out.push_str(&quoted(m));
        }
        if let Some(c) = &self.condition {
            out.push_str(" where ");
            out.push_str(c);
        }
        out
    }
}

fn column(results: &Results, name: &str) -> Vec<String> {
    results
        .rows()
        .iter()
        .filter_map(|row| row.get(name).and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

impl Client {
    // ------------------------------------------------------------------ //
    //  Databases                                                          //
    // ------------------------------------------------------------------ //

    pub async fn create_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("create database {}", quoted(name)), None).await?;
        Ok(())
    }

    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("drop database {}", quoted(name)), None).await?;
        Ok(())
    }

    pub async fn database_names(&self) -> Result<Vec<String>> {
        let results = self.execute("show databases", None).await?;
        Ok(column(&results, "name"))
    }

    // ------------------------------------------------------------------ //
    //  Measurements and series                                            //
    // ------------------------------------------------------------------ //

    pub async fn measurements(&self, database: Option<&str>) -> Result<Vec<String>> {
        let db = self.database_for(database)?;
        let results = self.execute("show measurements", Some(&db)).await?;
        Ok(column(&results, "name"))
    }

    pub async fn drop_measurement(&self, measurement: &str, database: Option<&str>) -> Result<()> {
        let db = self.database_for(database)?;
        self.execute(&format!("drop measurement {}", quoted(measurement)), Some(&db))
            .await?;
        Ok(())
    }

    /// Series keys, e.g. `cpu,host=a`.
    pub async fn series(&self, filter: &SeriesFilter) -> Result<Vec<String>> {
        let db = self.database_for(filter.database.as_deref())?;
        let results = self
            .execute(&format!("show series{}", filter.clauses()), Some(&db))
            .await?;
        Ok(column(&results, "key"))
    }

    pub async fn drop_series(&self, filter: &SeriesFilter) -> Result<()> {
        let db = self.database_for(filter.database.as_deref())?;
        self.execute(&format!("drop series{}", filter.clauses()), Some(&db))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------ //
    //  Users                                                              //
    // ------------------------------------------------------------------ //

    pub async fn users(&self) -> Result<Vec<UserInfo>> {
        self.execute("show users", None).await?.deserialize_rows()
    }

    pub async fn create_user(&self, username: &str, password: &str, admin: bool) -> Result<()> {
        let mut statement = format!(
            "create user {} with password {}",
            quoted(username),
            string_lit(password)
        );
        if admin {
            statement.push_str(" with all privileges");
        }
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let statement = format!("set password for {} = {}", quoted(username), string_lit(password));
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn drop_user(&self, username: &str) -> Result<()> {
        self.execute(&format!("drop user {}", quoted(username)), None).await?;
        Ok(())
    }

    pub async fn grant_privilege(
        &self,
        username: &str,
        privilege: Privilege,
        database: Option<&str>,
    ) -> Result<()> {
        let db = self.database_for(database)?;
        let statement = format!(
            "grant {} on {} to {}",
            privilege.as_str(),
            quoted(&db),
            quoted(username)
        );
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn revoke_privilege(
        &self,
        username: &str,
        privilege: Privilege,
        database: Option<&str>,
    ) -> Result<()> {
        let db = self.database_for(database)?;
        let statement = format!(
            "revoke {} on {} from {}",
            privilege.as_str(),
            quoted(&db),
            quoted(username)
        );
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn grant_admin_privilege(&self, username: &str) -> Result<()> {
        self.execute(&format!("grant all to {}", quoted(username)), None).await?;
        Ok(())
    }

    pub async fn revoke_admin_privilege(&self, username: &str) -> Result<()> {
        self.execute(&format!("revoke all from {}", quoted(username)), None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------ //
    //  Retention policies                                                 //
    // ------------------------------------------------------------------ //

    pub async fn create_retention_policy(&self, name: &str, policy: &RetentionPolicy) -> Result<()> {
        let statement = self.retention_statement("create", name, policy)?;
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn alter_retention_policy(&self, name: &str, policy: &RetentionPolicy) -> Result<()> {
        let statement = self.retention_statement("alter", name, policy)?;
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn drop_retention_policy(&self, name: &str, database: Option<&str>) -> Result<()> {
        let db = self.database_for(database)?;
        let statement = format!("drop retention policy {} on {}", quoted(name), quoted(&db));
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn retention_policies(&self, database: Option<&str>) -> Result<Vec<RetentionPolicyInfo>> {
        let db = self.database_for(database)?;
        self.execute(&format!("show retention policies on {}", quoted(&db)), None)
            .await?
            .deserialize_rows()
    }

    fn retention_statement(&self, verb: &str, name: &str, policy: &RetentionPolicy) -> Result<String> {
        let db = self.database_for(policy.database.as_deref())?;
        let mut statement = format!(
            "{verb} retention policy {} on {} duration {} replication {}",
            quoted(name),
            quoted(&db),
            policy.duration,
            policy.replication
        );
        if let Some(shard) = &policy.shard_duration {
            statement.push_str(" shard duration ");
            statement.push_str(shard);
        }
        if policy.is_default {
            statement.push_str(" default");
        }
        Ok(statement)
    }

    // ------------------------------------------------------------------ //
    //  Continuous queries and shards                                      //
    // ------------------------------------------------------------------ //

    /// `resample` is the raw clause body, e.g. `every 10m for 1h`.
    pub async fn create_continuous_query(
        &self,
        name: &str,
        query: &str,
        database: Option<&str>,
        resample: Option<&str>,
    ) -> Result<()> {
        let db = self.database_for(database)?;
        let resample = resample.map(|r| format!("resample {r} ")).unwrap_or_default();
        let statement = format!(
            "create continuous query {} on {} {resample}begin {query} end",
            quoted(name),
            quoted(&db)
        );
        self.execute(&statement, None).await?;
        Ok(())
    }

    /// Continuous queries defined on `database`.
    pub async fn continuous_queries(&self, database: Option<&str>) -> Result<Vec<ContinuousQueryInfo>> {
        let db = self.database_for(database)?;
        let results = self.execute("show continuous queries", Some(&db)).await?;
        let Some(group) = results.groups().iter().find(|g| g.name == db) else {
            return Ok(Vec::new());
        };
        results
            .rows_in(group)
            .iter()
            .map(|row| Ok(serde_json::from_value(serde_json::to_value(row)?)?))
            .collect()
    }

    pub async fn drop_continuous_query(&self, name: &str, database: Option<&str>) -> Result<()> {
        let db = self.database_for(database)?;
        let statement = format!("drop continuous query {} on {}", quoted(name), quoted(&db));
        self.execute(&statement, None).await?;
        Ok(())
    }

    pub async fn drop_shard(&self, shard_id: u64) -> Result<()> {
        self.execute(&format!("drop shard {shard_id}"), None).await?;
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::Error;
    use crate::transport::{FakeReply, FakeTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn client(fake: &FakeTransport) -> Client {
        let config = ClientConfig::new("http://db1:8086/metrics").unwrap();
        Client::with_transport(config, Arc::new(fake.clone())).unwrap()
    }

    fn ok() -> FakeReply {
        FakeReply::json(200, &json!({ "results": [{}] }))
    }

    fn last_statement(fake: &FakeTransport) -> String {
        let calls = fake.calls();
        let call = calls.last().unwrap();
        assert_eq!(call.method, reqwest::Method::POST);
        assert_eq!(call.url.path(), "/query");
        call.query_param("q").unwrap().to_string()
    }

    #[tokio::test]
    async fn database_statements_quote_identifiers() {
        let fake = FakeTransport::new();
        fake.push(ok()).push(ok());
        let client = client(&fake);

        client.create_database(r#"my "db""#).await.unwrap();
        assert_eq!(last_statement(&fake), r#"create database "my \"db\"""#);
        client.drop_database("old").await.unwrap();
        assert_eq!(last_statement(&fake), r#"drop database "old""#);
    }

    #[tokio::test]
    async fn database_names_reads_name_column() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::json(
            200,
            &json!({ "results": [{ "series": [{
                "name": "databases",
                "columns": ["name"],
                "values": [["_internal"], ["metrics"]]
            }] }] }),
        ));
        let names = client(&fake).database_names().await.unwrap();
        assert_eq!(names, vec!["_internal", "metrics"]);
    }

    #[tokio::test]
    async fn user_statements_escape_passwords() {
        let fake = FakeTransport::new();
        for _ in 0..4 {
            fake.push(ok());
        }
        let client = client(&fake);

        client.create_user("bob", "it's", true).await.unwrap();
        assert_eq!(
            last_statement(&fake),
            r#"create user "bob" with password 'it\'s' with all privileges"#
        );
        client.set_password("bob", "new").await.unwrap();
        assert_eq!(last_statement(&fake), r#"set password for "bob" = 'new'"#);
        client.grant_privilege("bob", Privilege::Read, None).await.unwrap();
        assert_eq!(last_statement(&fake), r#"grant READ on "metrics" to "bob""#);
        client.revoke_admin_privilege("bob").await.unwrap();
        assert_eq!(last_statement(&fake), r#"revoke all from "bob""#);
    }

    #[tokio::test]
    async fn retention_policy_statement_includes_options() {
        let fake = FakeTransport::new();
        fake.push(ok());
        let client = client(&fake);

        let policy = RetentionPolicy::new("7d")
            .replication(2)
            .shard_duration("1d")
            .default_policy();
        client.create_retention_policy("week", &policy).await.unwrap();
        assert_eq!(
            last_statement(&fake),
            r#"create retention policy "week" on "metrics" duration 7d replication 2 shard duration 1d default"#
        );
    }

    #[tokio::test]
    async fn retention_policies_deserialize() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::json(
            200,
            &json!({ "results": [{ "series": [{
                "columns": ["name", "duration", "shardGroupDuration", "replicaN", "default"],
                "values": [["autogen", "0s", "168h0m0s", 1, true]]
            }] }] }),
        ));
        let policies = client(&fake).retention_policies(None).await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].name, "autogen");
        assert!(policies[0].default);
    }

    #[tokio::test]
    async fn series_filter_builds_clauses() {
        let fake = FakeTransport::new();
        fake.push(ok());
        let client = client(&fake);
        let filter = SeriesFilter {
            measurement: Some("cpu".into()),
            condition: Some("host = 'a'".into()),
            ..SeriesFilter::default()
        };
        client.drop_series(&filter).await.unwrap();
        assert_eq!(last_statement(&fake), r#"drop series from "cpu" where host = 'a'"#);
        assert_eq!(fake.calls()[0].query_param("db"), Some("metrics"));
    }

    #[tokio::test]
    async fn continuous_queries_pick_the_database_group() {
        let fake = FakeTransport::new();
        fake.push(ok());
        fake.push(FakeReply::json(
            200,
            &json!({ "results": [{ "series": [
                { "name": "_internal", "columns": ["name", "query"], "values": [] },
                { "name": "metrics", "columns": ["name", "query"], "values": [["cq", "CREATE CONTINUOUS QUERY ..."]] }
            ] }] }),
        ));
        let client = client(&fake);

        client
            .create_continuous_query("cq", "select mean(v) into m2 from m group by time(1m)", None, Some("every 10m"))
            .await
            .unwrap();
        assert_eq!(
            last_statement(&fake),
            r#"create continuous query "cq" on "metrics" resample every 10m begin select mean(v) into m2 from m group by time(1m) end"#
        );

        let cqs = client.continuous_queries(None).await.unwrap();
        assert_eq!(cqs.len(), 1);
        assert_eq!(cqs[0].name, "cq");
    }

    #[tokio::test]
    async fn admin_errors_surface_from_the_envelope() {
        let fake = FakeTransport::new();
        fake.push(FakeReply::json(
            200,
            &json!({ "results": [{ "error": "user not found" }] }),
        ));
        let err = client(&fake).drop_user("ghost").await.unwrap_err();
        assert!(matches!(err, Error::Query(ref m) if m == "user not found"));
    }

    #[tokio::test]
    async fn drop_shard_uses_numeric_id() {
        let fake = FakeTransport::new();
        fake.push(ok());
        client(&fake).drop_shard(42).await.unwrap();
        assert_eq!(last_statement(&fake), "drop shard 42");
    }
}
