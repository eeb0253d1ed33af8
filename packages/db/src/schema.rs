//! Database schema definitions using SurrealQL.
//!
//! Bootstrap is idempotent: a marker record is checked first and the DDL is
//! only applied when it is missing or older than [`SCHEMA_VERSION`].

use serde::{Deserialize, Serialize};

use crate::repositories::NamedLock;
use crate::{Backend, Database, DbError, StoreConfig};

/// Version written to the marker record after a successful bootstrap.
pub const SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct SchemaMarker {
    version: i64,
    backend: String,
}

/// Initialize the scheduler schema if it is not present yet.
///
/// Returns `true` when the DDL was applied by this call.
pub async fn init_schema(db: &Database, config: &StoreConfig) -> Result<bool, DbError> {
    let backend = &config.backend;
    let mut response = db
        .query("SELECT version, backend FROM type::thing('scheduler_schema', 'current')")
        .await?;
    let markers: Vec<SchemaMarker> = response.take(0)?;

    if markers.iter().any(|m| m.version >= SCHEMA_VERSION) {
        tracing::debug!("Scheduler schema already present");
        return Ok(false);
    }

    tracing::info!("Initializing scheduler schema for {} backend...", backend.as_str());

    for script in ddl_for(config) {
        db.query(script).await?.check()?;
    }

    for name in NamedLock::ALL {
        db.query("UPSERT type::thing('named_lock', $name) SET lock_name = $name, holder = NONE, acquired_at = NONE")
            .bind(("name", name.as_str().to_string()))
            .await?
            .check()?;
    }

    db.query("UPSERT type::thing('scheduler_schema', 'current') CONTENT $marker")
        .bind((
            "marker",
            SchemaMarker {
                version: SCHEMA_VERSION,
                backend: backend.as_str().to_string(),
            },
        ))
        .await?
        .check()?;

    tracing::info!("Scheduler schema initialized");

    Ok(true)
}

/// Scripts for a backend, in application order.
fn ddl_for(config: &StoreConfig) -> Vec<String> {
    let mut scripts = Vec::new();

    // Shared servers may be reached by other users; embedded engines are
    // only reachable through this process.
    let permissions = match &config.backend {
        Backend::Remote { .. } => {
            scripts.push(format!(
                "DEFINE NAMESPACE IF NOT EXISTS {}; DEFINE DATABASE IF NOT EXISTS {};",
                config.namespace, config.database
            ));
            " PERMISSIONS NONE"
        }
        _ => "",
    };

    scripts.extend([
        JOB_DETAIL_SCHEMA,
        TRIGGER_SCHEMA,
        SCHEDULE_SCHEMA,
        FIRED_TRIGGER_SCHEMA,
        SCHEDULER_STATE_SCHEMA,
        LOCK_SCHEMA,
    ]
    .iter()
    .map(|script| script.replace("{permissions}", permissions)));
    scripts
}

/// Stored job definitions.
const JOB_DETAIL_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_detail SCHEMAFULL{permissions};

DEFINE FIELD IF NOT EXISTS job_name ON job_detail TYPE string;
DEFINE FIELD IF NOT EXISTS job_group ON job_detail TYPE string;
DEFINE FIELD IF NOT EXISTS job_type ON job_detail TYPE string;
DEFINE FIELD IF NOT EXISTS description ON job_detail TYPE option<string>;
DEFINE FIELD IF NOT EXISTS is_durable ON job_detail TYPE bool DEFAULT false;
DEFINE FIELD IF NOT EXISTS requests_recovery ON job_detail TYPE bool DEFAULT false;
DEFINE FIELD IF NOT EXISTS job_data ON job_detail TYPE string DEFAULT "{}";

DEFINE INDEX IF NOT EXISTS job_detail_key ON job_detail FIELDS job_group, job_name UNIQUE;
"#;

/// Columns shared by every schedule kind.
const TRIGGER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_trigger SCHEMAFULL{permissions};

DEFINE FIELD IF NOT EXISTS trigger_id ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS trigger_name ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS trigger_group ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS job_name ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS job_group ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS next_fire_time ON job_trigger TYPE option<int>;
DEFINE FIELD IF NOT EXISTS prev_fire_time ON job_trigger TYPE option<int>;
DEFINE FIELD IF NOT EXISTS priority ON job_trigger TYPE int DEFAULT 5;
DEFINE FIELD IF NOT EXISTS trigger_state ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS trigger_type ON job_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS start_time ON job_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS end_time ON job_trigger TYPE option<int>;
DEFINE FIELD IF NOT EXISTS misfire_instr ON job_trigger TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS times_triggered ON job_trigger TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS seq ON job_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS deferred ON job_trigger TYPE bool DEFAULT false;

DEFINE INDEX IF NOT EXISTS job_trigger_job ON job_trigger FIELDS job_group, job_name;
DEFINE INDEX IF NOT EXISTS job_trigger_ready ON job_trigger FIELDS trigger_state, next_fire_time;
"#;

/// Per-kind schedule columns, keyed by the owning trigger.
const SCHEDULE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS simple_trigger SCHEMAFULL{permissions};
DEFINE FIELD IF NOT EXISTS trigger_id ON simple_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS repeat_count ON simple_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS repeat_interval ON simple_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS times_triggered ON simple_trigger TYPE int DEFAULT 0;
DEFINE INDEX IF NOT EXISTS simple_trigger_id ON simple_trigger FIELDS trigger_id UNIQUE;

DEFINE TABLE IF NOT EXISTS cron_trigger SCHEMAFULL{permissions};
DEFINE FIELD IF NOT EXISTS trigger_id ON cron_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS cron_expression ON cron_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS time_zone_id ON cron_trigger TYPE string DEFAULT "UTC";
DEFINE INDEX IF NOT EXISTS cron_trigger_id ON cron_trigger FIELDS trigger_id UNIQUE;

DEFINE TABLE IF NOT EXISTS simprop_trigger SCHEMAFULL{permissions};
DEFINE FIELD IF NOT EXISTS trigger_id ON simprop_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS str_prop_1 ON simprop_trigger TYPE option<string>;
DEFINE FIELD IF NOT EXISTS int_prop_1 ON simprop_trigger TYPE option<int>;
DEFINE FIELD IF NOT EXISTS time_zone_id ON simprop_trigger TYPE string DEFAULT "UTC";
DEFINE INDEX IF NOT EXISTS simprop_trigger_id ON simprop_trigger FIELDS trigger_id UNIQUE;
"#;

/// Executions in progress, for crash recovery.
const FIRED_TRIGGER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS fired_trigger SCHEMAFULL{permissions};

DEFINE FIELD IF NOT EXISTS entry_id ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS trigger_id ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS job_name ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS job_group ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS instance_name ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS fired_time ON fired_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS sched_time ON fired_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS priority ON fired_trigger TYPE int;
DEFINE FIELD IF NOT EXISTS state ON fired_trigger TYPE string;
DEFINE FIELD IF NOT EXISTS requests_recovery ON fired_trigger TYPE bool DEFAULT false;

DEFINE INDEX IF NOT EXISTS fired_trigger_instance ON fired_trigger FIELDS instance_name;
DEFINE INDEX IF NOT EXISTS fired_trigger_job ON fired_trigger FIELDS job_group, job_name;
"#;

/// Instance heartbeats.
const SCHEDULER_STATE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS scheduler_state SCHEMAFULL{permissions};

DEFINE FIELD IF NOT EXISTS instance_name ON scheduler_state TYPE string;
DEFINE FIELD IF NOT EXISTS last_checkin_time ON scheduler_state TYPE int;
DEFINE FIELD IF NOT EXISTS checkin_interval ON scheduler_state TYPE int;
"#;

/// Named critical sections shared by all instances.
const LOCK_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS named_lock SCHEMAFULL{permissions};

DEFINE FIELD IF NOT EXISTS lock_name ON named_lock TYPE string;
DEFINE FIELD IF NOT EXISTS holder ON named_lock TYPE option<string>;
DEFINE FIELD IF NOT EXISTS acquired_at ON named_lock TYPE option<int>;

DEFINE TABLE IF NOT EXISTS scheduler_schema SCHEMALESS{permissions};
"#;
