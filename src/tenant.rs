use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::engine::{Engine, ReservePolicy};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-tenant engine settings shared by every tenant of a server.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub reserve_policy: ReservePolicy,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(30),
            reserve_policy: ReservePolicy::default(),
        }
    }
}

/// Manages per-tenant engines. Each tenant (one hospital) gets its own
/// Engine + WAL + sweeper + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Held entry lock: at most one engine (and WAL writer) per tenant.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.settings.reserve_policy)?);
                slot.insert(engine.clone());
                engine
            }
        };

        let sweeper_engine = engine.clone();
        let every = self.settings.sweep_interval;
        tokio::spawn(async move {
            reaper::run_sweeper(sweeper_engine, every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("loaded tenant {tenant}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    const DAY0: Ms = 1_767_225_600_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let eng_a = tm.get_or_create("st_marys").unwrap();
        let eng_b = tm.get_or_create("general").unwrap();

        // Same room id in both tenants
        let rid = Ulid::new();
        eng_a.create_room(rid, "OR 1".into(), RoomType::Surgery, 1, 1, None).await.unwrap();
        eng_b.create_room(rid, "OR 1".into(), RoomType::Surgery, 1, 1, None).await.unwrap();

        eng_a
            .validate_and_reserve(NewBooking {
                id: Ulid::new(),
                room_id: rid,
                requester_id: Ulid::new(),
                patient_id: None,
                start: DAY0,
                end: DAY0 + 1000,
                purpose: None,
            })
            .await
            .unwrap();

        assert_eq!(eng_a.get_room_info(rid).await.unwrap().status, RoomStatus::Reserved);
        assert_eq!(eng_b.get_room_info(rid).await.unwrap().status, RoomStatus::Available);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_policy_is_applied() {
        let dir = test_data_dir("policy");
        let settings = TenantSettings {
            reserve_policy: ReservePolicy::Exclusive,
            ..Default::default()
        };
        let tm = TenantManager::new(dir, settings);
        assert_eq!(tm.get_or_create("clinic").unwrap().policy(), ReservePolicy::Exclusive);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, TenantSettings::default());

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
