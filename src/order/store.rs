//! Work Order Persistence
//!
//! Work orders are retained after they finish so their status can be
//! queried later. Every write is checked against the stored status, so a
//! store never holds a regressed or reopened order.
//!
//! The directory store keeps one JSON document per order under
//! `<state_dir>/orders/`.

use std::fs;
use std::path::PathBuf;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::model::{check_transition, WorkOrder};
use crate::error::{OrderflowError, Result};
use crate::workflow::store::{encode_file_name, write_atomically};

/// Storage for work order state.
pub trait WorkOrderStore: Send + Sync {
    /// Stores a new order. Fails if the URI is already taken.
    fn insert(&self, order: &WorkOrder) -> Result<()>;

    /// Replaces a stored order, enforcing status monotonicity.
    fn update(&self, order: &WorkOrder) -> Result<()>;

    /// Loads an order, failing with `NotFound` if absent.
    fn get(&self, uri: &str) -> Result<WorkOrder>;

    /// All orders of a workflow, oldest first.
    fn list_by_workflow(&self, workflow_uri: &str) -> Result<Vec<WorkOrder>>;
}

fn sort_by_creation(orders: &mut [WorkOrder]) {
    orders.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.uri.cmp(&b.uri)));
}

/// In-memory work order store.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: DashMap<String, WorkOrder>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkOrderStore for MemoryOrderStore {
    fn insert(&self, order: &WorkOrder) -> Result<()> {
        match self.orders.entry(order.uri.clone()) {
            Entry::Occupied(_) => Err(OrderflowError::Config(format!(
                "Work order {} already exists",
                order.uri
            ))),
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    fn update(&self, order: &WorkOrder) -> Result<()> {
        let mut stored = self
            .orders
            .get_mut(&order.uri)
            .ok_or_else(|| OrderflowError::work_order_not_found(&order.uri))?;
        check_transition(&order.uri, stored.status, order.status)?;
        *stored = order.clone();
        Ok(())
    }

    fn get(&self, uri: &str) -> Result<WorkOrder> {
        self.orders
            .get(uri)
            .map(|o| o.value().clone())
            .ok_or_else(|| OrderflowError::work_order_not_found(uri))
    }

    fn list_by_workflow(&self, workflow_uri: &str) -> Result<Vec<WorkOrder>> {
        let mut orders: Vec<WorkOrder> = self
            .orders
            .iter()
            .filter(|o| o.workflow_uri == workflow_uri)
            .map(|o| o.value().clone())
            .collect();
        sort_by_creation(&mut orders);
        Ok(orders)
    }
}

/// Work order store backed by JSON files.
///
/// Writes are serialized through a mutex so the read-check-write of
/// [`update`](WorkOrderStore::update) is atomic within the process.
pub struct DirectoryOrderStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryOrderStore {
    /// Opens (creating if needed) an order directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Work orders stored in {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_name(uri)))
    }

    fn read(&self, uri: &str) -> Result<Option<WorkOrder>> {
        let path = self.path_for(uri);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write(&self, order: &WorkOrder) -> Result<()> {
        let json = serde_json::to_string_pretty(order)?;
        write_atomically(&self.path_for(&order.uri), &json)?;
        debug!("Saved work order {} ({})", order.uri, order.status);
        Ok(())
    }
}

impl WorkOrderStore for DirectoryOrderStore {
    fn insert(&self, order: &WorkOrder) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.path_for(&order.uri).exists() {
            return Err(OrderflowError::Config(format!(
                "Work order {} already exists",
                order.uri
            )));
        }
        self.write(order)
    }

    fn update(&self, order: &WorkOrder) -> Result<()> {
        let _guard = self.write_lock.lock();
        let stored = self
            .read(&order.uri)?
            .ok_or_else(|| OrderflowError::work_order_not_found(&order.uri))?;
        check_transition(&order.uri, stored.status, order.status)?;
        self.write(order)
    }

    fn get(&self, uri: &str) -> Result<WorkOrder> {
        self.read(uri)?
            .ok_or_else(|| OrderflowError::work_order_not_found(uri))
    }

    fn list_by_workflow(&self, workflow_uri: &str) -> Result<Vec<WorkOrder>> {
        let mut orders = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(OrderflowError::from)
                .and_then(|c| Ok(serde_json::from_str::<WorkOrder>(&c)?));
            match parsed {
                Ok(order) if order.workflow_uri == workflow_uri => orders.push(order),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable work order {}: {}", path.display(), e),
            }
        }
        sort_by_creation(&mut orders);
        Ok(orders)
    }
}
