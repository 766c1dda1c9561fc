//! State management with SQLite persistence.
//!
//! The StateManager holds the intended state of the subsystem:
//! - Service instances and their VLAN/bind-IP assignment
//! - Virtual interfaces provisioned on routers
//! - Device routings and their kill-switch fields
//! - The per-router VLAN allocation ledger

use crate::error::{Result, VifError};
use crate::types::{
    DeviceRouting, GatewayStatus, GatewayType, InterfaceStatus, KillSwitchMode, KillSwitchState,
    ServiceInstance, VirtualInterface,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument};

pub mod migrations;


/// One row of the VLAN allocation ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct VlanAllocation {
    pub router_id: String,
    pub vlan_id: u16,
    pub instance_id: String,
    pub service_type: String,
    pub subnet: String,
    pub status: AllocationStatus,
    pub allocated_at: SystemTime,
    pub released_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Allocated,
    Released,
}

impl AllocationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Released => "released",
        }
    }
}

fn to_unix(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn from_unix(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> VifError {
    move |e| {
        metrics::counter!("nnc_db_errors_total", "operation" => operation).increment(1);
        VifError::DatabaseError(e.to_string())
    }
}

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");

        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| VifError::IoError {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            VifError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| VifError::DatabaseError(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // Every in-memory connection is its own database, so pin the pool to one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| VifError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Service Instance Operations
    // ========================

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn insert_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let config_json = serde_json::to_string(&instance.config)
            .map_err(|e| VifError::DatabaseError(format!("Failed to serialize config: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO service_instances (id, router_id, feature_id, instance_name, config, vlan_id, bind_ip, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.router_id)
        .bind(&instance.feature_id)
        .bind(&instance.instance_name)
        .bind(config_json)
        .bind(instance.vlan_id.map(i64::from))
        .bind(&instance.bind_ip)
        .bind(to_unix(instance.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_error("insert_instance"))?;

        Ok(())
    }

    /// Get a service instance, or `NotFound`.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn get_instance(&self, id: &str) -> Result<ServiceInstance> {
        let row = sqlx::query("SELECT * FROM service_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_instance"))?
            .ok_or_else(|| VifError::not_found("ServiceInstance", id))?;

        row_to_instance(row)
    }

    /// Record the VLAN and bind address assigned to an instance.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn set_instance_bridge(&self, id: &str, vlan_id: u16, bind_ip: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE service_instances SET vlan_id = ?, bind_ip = ? WHERE id = ?")
                .bind(i64::from(vlan_id))
                .bind(bind_ip)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_error("set_instance_bridge"))?;

        if result.rows_affected() == 0 {
            return Err(VifError::not_found("ServiceInstance", id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn clear_instance_bridge(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE service_instances SET vlan_id = NULL, bind_ip = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("clear_instance_bridge"))?;

        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM service_instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_instance"))?;

        Ok(())
    }

    // ========================
    // Virtual Interface Operations
    // ========================

    #[instrument(skip(self, vif), fields(interface = %vif.interface_name))]
    pub async fn insert_interface(&self, vif: &VirtualInterface) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO virtual_interfaces (id, instance_id, interface_name, vlan_id, ip_address, gateway_type, gateway_status, routing_mark, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vif.id)
        .bind(&vif.instance_id)
        .bind(&vif.interface_name)
        .bind(i64::from(vif.vlan_id))
        .bind(&vif.ip_address)
        .bind(vif.gateway_type.as_str())
        .bind(vif.gateway_status.to_string())
        .bind(&vif.routing_mark)
        .bind(vif.status.to_string())
        .bind(to_unix(vif.created_at))
        .bind(to_unix(vif.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error("insert_interface"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_interface(&self, id: &str) -> Result<VirtualInterface> {
        let row = sqlx::query("SELECT * FROM virtual_interfaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_interface"))?
            .ok_or_else(|| VifError::not_found("VirtualInterface", id))?;

        row_to_interface(row)
    }

    /// Look up the interface owned by an instance.
    #[instrument(skip(self))]
    pub async fn find_interface_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<VirtualInterface>> {
        sqlx::query("SELECT * FROM virtual_interfaces WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_interface_by_instance"))?
            .map(row_to_interface)
            .transpose()
    }

    #[instrument(skip(self))]
    pub async fn find_interface_by_name(&self, name: &str) -> Result<Option<VirtualInterface>> {
        sqlx::query("SELECT * FROM virtual_interfaces WHERE interface_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_interface_by_name"))?
            .map(row_to_interface)
            .transpose()
    }

    #[instrument(skip(self))]
    pub async fn list_interfaces(&self) -> Result<Vec<VirtualInterface>> {
        let rows = sqlx::query("SELECT * FROM virtual_interfaces ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_interfaces"))?;

        rows.into_iter().map(row_to_interface).collect()
    }

    #[instrument(skip(self))]
    pub async fn update_interface_status(&self, id: &str, status: InterfaceStatus) -> Result<()> {
        sqlx::query("UPDATE virtual_interfaces SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(to_unix(SystemTime::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("update_interface_status"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_interface_gateway(
        &self,
        id: &str,
        gateway_type: GatewayType,
        gateway_status: GatewayStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE virtual_interfaces SET gateway_type = ?, gateway_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(gateway_type.as_str())
        .bind(gateway_status.to_string())
        .bind(to_unix(SystemTime::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_interface_gateway"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_interface(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM virtual_interfaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_interface"))?;

        Ok(())
    }

    // ========================
    // Device Routing Operations
    // ========================

    #[instrument(skip(self, routing), fields(routing_id = %routing.id))]
    pub async fn insert_routing(&self, routing: &DeviceRouting) -> Result<()> {
        let ks = &routing.kill_switch;
        sqlx::query(
            r#"
            INSERT INTO device_routings (id, router_id, device_id, mac_address, instance_id, interface_id, routing_mark, mangle_rule_id,
                kill_switch_enabled, kill_switch_mode, kill_switch_rule_id, kill_switch_active, kill_switch_activated_at,
                kill_switch_fallback_interface_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&routing.id)
        .bind(&routing.router_id)
        .bind(&routing.device_id)
        .bind(&routing.mac_address)
        .bind(&routing.instance_id)
        .bind(&routing.interface_id)
        .bind(&routing.routing_mark)
        .bind(&routing.mangle_rule_id)
        .bind(ks.enabled)
        .bind(ks.mode.as_str())
        .bind(&ks.rule_id)
        .bind(ks.active)
        .bind(ks.activated_at.map(to_unix))
        .bind(&ks.fallback_interface_id)
        .bind(to_unix(routing.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_error("insert_routing"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_routing(&self, id: &str) -> Result<DeviceRouting> {
        let row = sqlx::query("SELECT * FROM device_routings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_routing"))?
            .ok_or_else(|| VifError::not_found("DeviceRouting", id))?;

        row_to_routing(row)
    }

    #[instrument(skip(self))]
    pub async fn list_routings_by_instance(&self, instance_id: &str) -> Result<Vec<DeviceRouting>> {
        self.list_routings_where("instance_id", instance_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_routings_by_interface(
        &self,
        interface_id: &str,
    ) -> Result<Vec<DeviceRouting>> {
        self.list_routings_where("interface_id", interface_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_routings_by_router(&self, router_id: &str) -> Result<Vec<DeviceRouting>> {
        self.list_routings_where("router_id", router_id).await
    }

    /// Routings on a router that carry a kill-switch rule.
    #[instrument(skip(self))]
    pub async fn list_kill_switch_enabled(&self, router_id: &str) -> Result<Vec<DeviceRouting>> {
        let rows = sqlx::query(
            "SELECT * FROM device_routings WHERE router_id = ? AND kill_switch_enabled = 1 ORDER BY created_at ASC",
        )
        .bind(router_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list_kill_switch_enabled"))?;

        rows.into_iter().map(row_to_routing).collect()
    }

    // Column names are fixed call-site literals, never caller input.
    async fn list_routings_where(&self, column: &str, value: &str) -> Result<Vec<DeviceRouting>> {
        let sql = format!("SELECT * FROM device_routings WHERE {} = ? ORDER BY created_at ASC", column);
        let rows = sqlx::query(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_routings"))?;

        rows.into_iter().map(row_to_routing).collect()
    }

    /// Overwrite all kill-switch columns of a routing.
    #[instrument(skip(self, state), fields(routing_id = %id))]
    pub async fn update_kill_switch(&self, id: &str, state: &KillSwitchState) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE device_routings SET
                kill_switch_enabled = ?, kill_switch_mode = ?, kill_switch_rule_id = ?,
                kill_switch_active = ?, kill_switch_activated_at = ?, kill_switch_fallback_interface_id = ?
            WHERE id = ?
            "#,
        )
        .bind(state.enabled)
        .bind(state.mode.as_str())
        .bind(&state.rule_id)
        .bind(state.active)
        .bind(state.activated_at.map(to_unix))
        .bind(&state.fallback_interface_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_kill_switch"))?;

        if result.rows_affected() == 0 {
            return Err(VifError::not_found("DeviceRouting", id));
        }
        Ok(())
    }

    /// Delete a routing. Returns false if it did not exist.
    #[instrument(skip(self))]
    pub async fn delete_routing(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_routings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_routing"))?;

        Ok(result.rows_affected() > 0)
    }

    // ========================
    // VLAN Allocation Operations
    // ========================

    /// Record an allocation, reviving a previously released row.
    #[instrument(skip(self))]
    pub async fn upsert_vlan_allocation(
        &self,
        router_id: &str,
        vlan_id: u16,
        instance_id: &str,
        service_type: &str,
        subnet: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vlan_allocations (router_id, vlan_id, instance_id, service_type, subnet, status, allocated_at, released_at)
            VALUES (?, ?, ?, ?, ?, 'allocated', ?, NULL)
            ON CONFLICT(router_id, vlan_id) DO UPDATE SET
                instance_id = excluded.instance_id,
                service_type = excluded.service_type,
                subnet = excluded.subnet,
                status = 'allocated',
                allocated_at = excluded.allocated_at,
                released_at = NULL
            "#,
        )
        .bind(router_id)
        .bind(i64::from(vlan_id))
        .bind(instance_id)
        .bind(service_type)
        .bind(subnet)
        .bind(to_unix(SystemTime::now()))
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert_vlan_allocation"))?;

        Ok(())
    }

    /// Mark an allocation released. Returns false if no allocated row matched.
    #[instrument(skip(self))]
    pub async fn release_vlan_allocation(&self, router_id: &str, vlan_id: u16) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE vlan_allocations SET status = 'released', released_at = ? WHERE router_id = ? AND vlan_id = ? AND status = 'allocated'",
        )
        .bind(to_unix(SystemTime::now()))
        .bind(router_id)
        .bind(i64::from(vlan_id))
        .execute(&self.pool)
        .await
        .map_err(db_error("release_vlan_allocation"))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn list_vlan_allocations(&self, router_id: &str) -> Result<Vec<VlanAllocation>> {
        let rows = sqlx::query("SELECT * FROM vlan_allocations WHERE router_id = ? ORDER BY vlan_id")
            .bind(router_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_vlan_allocations"))?;

        rows.into_iter().map(row_to_allocation).collect()
    }

    /// Instance holding an allocated ID, if any.
    #[instrument(skip(self))]
    pub async fn vlan_owner(&self, router_id: &str, vlan_id: u16) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT instance_id FROM vlan_allocations \
             WHERE router_id = ? AND vlan_id = ? AND status = 'allocated'",
        )
        .bind(router_id)
        .bind(i64::from(vlan_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("vlan_owner"))
    }

    /// IDs currently allocated on a router.
    #[instrument(skip(self))]
    pub async fn allocated_vlan_ids(&self, router_id: &str) -> Result<HashSet<u16>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT vlan_id FROM vlan_allocations WHERE router_id = ? AND status = 'allocated'",
        )
        .bind(router_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("allocated_vlan_ids"))?;

        Ok(ids.into_iter().filter_map(|id| u16::try_from(id).ok()).collect())
    }
}

fn parse_column<T: FromStr>(row: &SqliteRow, column: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column);
    raw.parse::<T>()
        .map_err(|e| VifError::DatabaseError(format!("Invalid value in column {}: {}", column, e)))
}

fn vlan_column(row: &SqliteRow, column: &str) -> Result<u16> {
    let raw: i64 = row.get(column);
    u16::try_from(raw)
        .map_err(|_| VifError::DatabaseError(format!("VLAN ID {} out of range", raw)))
}

fn row_to_instance(row: SqliteRow) -> Result<ServiceInstance> {
    let config_json: String = row.get("config");
    let config = serde_json::from_str(&config_json)
        .map_err(|e| VifError::DatabaseError(format!("Failed to deserialize config: {}", e)))?;

    let vlan_id = row
        .get::<Option<i64>, _>("vlan_id")
        .map(|v| {
            u16::try_from(v)
                .map_err(|_| VifError::DatabaseError(format!("VLAN ID {} out of range", v)))
        })
        .transpose()?;

    Ok(ServiceInstance {
        id: row.get("id"),
        router_id: row.get("router_id"),
        feature_id: row.get("feature_id"),
        instance_name: row.get("instance_name"),
        config,
        vlan_id,
        bind_ip: row.get("bind_ip"),
        created_at: from_unix(row.get("created_at")),
    })
}

fn row_to_interface(row: SqliteRow) -> Result<VirtualInterface> {
    Ok(VirtualInterface {
        vlan_id: vlan_column(&row, "vlan_id")?,
        gateway_type: parse_column(&row, "gateway_type")?,
        gateway_status: parse_column(&row, "gateway_status")?,
        status: parse_column(&row, "status")?,
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        interface_name: row.get("interface_name"),
        ip_address: row.get("ip_address"),
        routing_mark: row.get("routing_mark"),
        created_at: from_unix(row.get("created_at")),
        updated_at: from_unix(row.get("updated_at")),
    })
}

fn row_to_routing(row: SqliteRow) -> Result<DeviceRouting> {
    let mode: KillSwitchMode = parse_column(&row, "kill_switch_mode")?;

    Ok(DeviceRouting {
        id: row.get("id"),
        router_id: row.get("router_id"),
        device_id: row.get("device_id"),
        mac_address: row.get("mac_address"),
        instance_id: row.get("instance_id"),
        interface_id: row.get("interface_id"),
        routing_mark: row.get("routing_mark"),
        mangle_rule_id: row.get("mangle_rule_id"),
        kill_switch: KillSwitchState {
            enabled: row.get("kill_switch_enabled"),
            mode,
            rule_id: row.get("kill_switch_rule_id"),
            active: row.get("kill_switch_active"),
            activated_at: row.get::<Option<i64>, _>("kill_switch_activated_at").map(from_unix),
            fallback_interface_id: row.get("kill_switch_fallback_interface_id"),
        },
        created_at: from_unix(row.get("created_at")),
    })
}

fn row_to_allocation(row: SqliteRow) -> Result<VlanAllocation> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "allocated" => AllocationStatus::Allocated,
        "released" => AllocationStatus::Released,
        other => {
            return Err(VifError::DatabaseError(format!("Unknown allocation status: {}", other)))
        }
    };

    Ok(VlanAllocation {
        router_id: row.get("router_id"),
        vlan_id: vlan_column(&row, "vlan_id")?,
        instance_id: row.get("instance_id"),
        service_type: row.get("service_type"),
        subnet: row.get("subnet"),
        status,
        allocated_at: from_unix(row.get("allocated_at")),
        released_at: row.get::<Option<i64>, _>("released_at").map(from_unix),
    })
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
