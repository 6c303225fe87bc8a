use tracing::info;

use stockledger_core::{DomainError, DomainResult, ItemId};
use stockledger_inventory::{Item, ItemUpdate, NewItem};

use super::InventoryEngine;
use crate::store::{ChangeSet, InventoryStore, Write};

impl<S> InventoryEngine<S>
where
    S: InventoryStore,
{
    pub fn create_item(&self, new: NewItem) -> DomainResult<Item> {
        let item = Item::create(new, self.config.default_costing, self.now())?;
        if self.store.get_item(&item.id)?.is_some() {
            return Err(DomainError::validation(format!("item {} already exists", item.id)));
        }
        self.ensure_unique_sku(&item.id, &item.sku)?;

        self.store.commit(ChangeSet {
            items: vec![Write::insert(item.clone())],
            ..ChangeSet::default()
        })?;
        info!(item_id = %item.id, sku = %item.sku, "item created");
        Ok(item)
    }

    /// Once an item has movements only thresholds, prices, name, status and
    /// forecast model may change.
    pub fn update_item(&self, item_id: &ItemId, update: ItemUpdate) -> DomainResult<Item> {
        let current = self.require_item(item_id)?;
        let referenced = self.store.has_movements(item_id)?;
        let mut item = current.value;
        item.apply_update(update, referenced, self.now())?;
        self.ensure_unique_sku(&item.id, &item.sku)?;

        self.store.commit(ChangeSet {
            items: vec![Write::update(item.clone(), current.version)],
            ..ChangeSet::default()
        })?;
        info!(item_id = %item.id, referenced, "item updated");
        Ok(item)
    }

    pub fn get_item(&self, item_id: &ItemId) -> DomainResult<Item> {
        Ok(self.require_item(item_id)?.value)
    }

    pub fn list_items(&self) -> DomainResult<Vec<Item>> {
        Ok(self.store.list_items()?)
    }

    pub(super) fn ensure_unique_sku(&self, item_id: &ItemId, sku: &str) -> DomainResult<()> {
        let taken = self
            .store
            .list_items()?
            .into_iter()
            .any(|other| &other.id != item_id && other.sku == sku);
        if taken {
            return Err(DomainError::validation(format!("sku {sku} is already in use")));
        }
        Ok(())
    }
}
