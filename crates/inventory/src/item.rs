use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId};

use crate::costing::CostingMethod;

/// Demand model used when forecasting for an item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ForecastModel {
    MovingAverage { window: usize },
    ExponentialSmoothing { alpha: f64 },
    LinearRegression,
    /// Seasonal decomposition with a period in days.
    Seasonal { period: usize },
    /// Delegated to an externally supplied predictor.
    External,
}

impl ForecastModel {
    pub fn name(&self) -> &'static str {
        match self {
            ForecastModel::MovingAverage { .. } => "moving_average",
            ForecastModel::ExponentialSmoothing { .. } => "exponential_smoothing",
            ForecastModel::LinearRegression => "linear_regression",
            ForecastModel::Seasonal { .. } => "seasonal",
            ForecastModel::External => "external",
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        match *self {
            ForecastModel::MovingAverage { window } if window == 0 => {
                Err(DomainError::validation("moving average window must be at least 1"))
            }
            ForecastModel::ExponentialSmoothing { alpha } if !(alpha > 0.0 && alpha <= 1.0) => {
                Err(DomainError::validation("smoothing factor must be in (0, 1]"))
            }
            ForecastModel::Seasonal { period } if period < 2 => {
                Err(DomainError::validation("seasonal period must be at least 2 days"))
            }
            _ => Ok(()),
        }
    }
}

impl core::str::FromStr for ForecastModel {
    type Err = String;

    /// Accepts `moving_average[:window]`, `exponential_smoothing[:alpha]`,
    /// `linear_regression`, `seasonal[:period]` and `external`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.as_str(), None),
        };
        let bad = |arg: &str| format!("invalid parameter '{arg}' for forecast model '{name}'");
        let model = match name {
            "moving_average" => ForecastModel::MovingAverage {
                window: arg.map_or(Ok(7), |a| a.parse().map_err(|_| bad(a)))?,
            },
            "exponential_smoothing" => ForecastModel::ExponentialSmoothing {
                alpha: arg.map_or(Ok(0.3), |a| a.parse().map_err(|_| bad(a)))?,
            },
            "linear_regression" => ForecastModel::LinearRegression,
            "seasonal" => ForecastModel::Seasonal {
                period: arg.map_or(Ok(7), |a| a.parse().map_err(|_| bad(a)))?,
            },
            "external" => ForecastModel::External,
            other => return Err(format!("unknown forecast model '{other}'")),
        };
        model.validate().map_err(|e| e.to_string())?;
        Ok(model)
    }
}

/// One component of a kit's bill of materials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitComponent {
    pub item_id: ItemId,
    /// Units per kit.
    pub quantity: i64,
    /// Optional components are skipped when short instead of failing the assembly.
    pub optional: bool,
    /// Tried in order when the primary component is short.
    pub substitutes: Vec<ItemId>,
}

impl KitComponent {
    pub fn new(item_id: ItemId, quantity: i64) -> Self {
        Self {
            item_id,
            quantity,
            optional: false,
            substitutes: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_substitutes(mut self, substitutes: Vec<ItemId>) -> Self {
        self.substitutes = substitutes;
        self
    }
}

/// Catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    pub min_stock: i64,
    /// 0 means no maximum.
    pub max_stock: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub lead_time_days: u32,
    pub cost_price: i64,
    pub sell_price: i64,
    pub costing_method: CostingMethod,
    pub forecast_model: Option<ForecastModel>,
    pub requires_serial: bool,
    pub requires_batch: bool,
    pub is_kit: bool,
    pub components: Vec<KitComponent>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `Item::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub id: Option<ItemId>,
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    pub min_stock: i64,
    pub max_stock: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub lead_time_days: u32,
    pub cost_price: i64,
    pub sell_price: i64,
    pub costing_method: Option<CostingMethod>,
    pub forecast_model: Option<ForecastModel>,
    pub requires_serial: bool,
    pub requires_batch: bool,
}

impl NewItem {
    pub fn new(sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            sku: sku.into(),
            name: name.into(),
            unit_of_measure: "each".to_string(),
            min_stock: 0,
            max_stock: 0,
            reorder_point: 0,
            reorder_quantity: 0,
            lead_time_days: 0,
            cost_price: 0,
            sell_price: 0,
            costing_method: None,
            forecast_model: None,
            requires_serial: false,
            requires_batch: false,
        }
    }

    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_prices(mut self, cost_price: i64, sell_price: i64) -> Self {
        self.cost_price = cost_price;
        self.sell_price = sell_price;
        self
    }

    pub fn with_thresholds(mut self, min: i64, max: i64, reorder_point: i64, reorder_quantity: i64) -> Self {
        self.min_stock = min;
        self.max_stock = max;
        self.reorder_point = reorder_point;
        self.reorder_quantity = reorder_quantity;
        self
    }

    pub fn with_lead_time(mut self, days: u32) -> Self {
        self.lead_time_days = days;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.requires_serial = true;
        self
    }

    pub fn batched(mut self) -> Self {
        self.requires_batch = true;
        self
    }

    pub fn with_costing(mut self, method: CostingMethod) -> Self {
        self.costing_method = Some(method);
        self
    }

    pub fn with_forecast_model(mut self, model: ForecastModel) -> Self {
        self.forecast_model = Some(model);
        self
    }
}

/// Partial update. Fields in the second group are frozen once the item has
/// ledger history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub name: Option<String>,
    pub min_stock: Option<i64>,
    pub max_stock: Option<i64>,
    pub reorder_point: Option<i64>,
    pub reorder_quantity: Option<i64>,
    pub lead_time_days: Option<u32>,
    pub cost_price: Option<i64>,
    pub sell_price: Option<i64>,
    pub forecast_model: Option<Option<ForecastModel>>,
    pub active: Option<bool>,

    pub sku: Option<String>,
    pub unit_of_measure: Option<String>,
    pub costing_method: Option<CostingMethod>,
    pub requires_serial: Option<bool>,
    pub requires_batch: Option<bool>,
}

impl ItemUpdate {
    fn touches_identity(&self) -> bool {
        self.sku.is_some()
            || self.unit_of_measure.is_some()
            || self.costing_method.is_some()
            || self.requires_serial.is_some()
            || self.requires_batch.is_some()
    }
}

impl Item {
    pub fn create(
        new: NewItem,
        default_costing: CostingMethod,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let id = match new.id {
            Some(id) => ItemId::parse(id.as_str())?,
            None => ItemId::generate(),
        };
        let item = Self {
            id,
            sku: new.sku,
            name: new.name,
            unit_of_measure: new.unit_of_measure,
            min_stock: new.min_stock,
            max_stock: new.max_stock,
            reorder_point: new.reorder_point,
            reorder_quantity: new.reorder_quantity,
            lead_time_days: new.lead_time_days,
            cost_price: new.cost_price,
            sell_price: new.sell_price,
            costing_method: new.costing_method.unwrap_or(default_costing),
            forecast_model: new.forecast_model,
            requires_serial: new.requires_serial,
            requires_batch: new.requires_batch,
            is_kit: false,
            components: Vec::new(),
            active: true,
            created_at: at,
            updated_at: at,
        };
        item.validate()?;
        Ok(item)
    }

    /// Turn a fresh item into a kit. Cross-item checks (components exist and
    /// are not themselves tracked) are the caller's job.
    pub fn make_kit(&mut self, components: Vec<KitComponent>, at: DateTime<Utc>) -> DomainResult<()> {
        let mut candidate = self.clone();
        candidate.is_kit = true;
        candidate.components = components;
        candidate.updated_at = at;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Apply a partial update. `referenced` is true once any movement exists for
    /// the item.
    pub fn apply_update(
        &mut self,
        update: ItemUpdate,
        referenced: bool,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if referenced && update.touches_identity() {
            return Err(DomainError::validation(format!(
                "item {} has ledger history; only thresholds, prices, name, status and forecast model may change",
                self.id
            )));
        }

        let mut next = self.clone();
        if let Some(v) = update.name {
            next.name = v;
        }
        if let Some(v) = update.min_stock {
            next.min_stock = v;
        }
        if let Some(v) = update.max_stock {
            next.max_stock = v;
        }
        if let Some(v) = update.reorder_point {
            next.reorder_point = v;
        }
        if let Some(v) = update.reorder_quantity {
            next.reorder_quantity = v;
        }
        if let Some(v) = update.lead_time_days {
            next.lead_time_days = v;
        }
        if let Some(v) = update.cost_price {
            next.cost_price = v;
        }
        if let Some(v) = update.sell_price {
            next.sell_price = v;
        }
        if let Some(v) = update.forecast_model {
            next.forecast_model = v;
        }
        if let Some(v) = update.active {
            next.active = v;
        }
        if let Some(v) = update.sku {
            next.sku = v;
        }
        if let Some(v) = update.unit_of_measure {
            next.unit_of_measure = v;
        }
        if let Some(v) = update.costing_method {
            next.costing_method = v;
        }
        if let Some(v) = update.requires_serial {
            next.requires_serial = v;
        }
        if let Some(v) = update.requires_batch {
            next.requires_batch = v;
        }
        next.updated_at = at;
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if self.unit_of_measure.trim().is_empty() {
            return Err(DomainError::validation("unit of measure cannot be empty"));
        }
        for (field, value) in [
            ("min_stock", self.min_stock),
            ("max_stock", self.max_stock),
            ("reorder_point", self.reorder_point),
            ("reorder_quantity", self.reorder_quantity),
            ("cost_price", self.cost_price),
            ("sell_price", self.sell_price),
        ] {
            if value < 0 {
                return Err(DomainError::validation(format!("{field} cannot be negative")));
            }
        }
        if self.max_stock > 0 && self.min_stock > self.max_stock {
            return Err(DomainError::validation("min_stock cannot exceed max_stock"));
        }
        if let Some(model) = &self.forecast_model {
            model.validate()?;
        }

        if self.is_kit {
            if self.requires_serial || self.requires_batch {
                return Err(DomainError::validation(
                    "a kit is assembled, not received; it cannot require serial or batch tracking",
                ));
            }
            if self.components.is_empty() {
                return Err(DomainError::validation("a kit needs at least one component"));
            }
            let mut seen = std::collections::HashSet::new();
            for component in &self.components {
                if component.quantity <= 0 {
                    return Err(DomainError::validation("component quantity must be positive"));
                }
                if component.item_id == self.id || component.substitutes.contains(&self.id) {
                    return Err(DomainError::validation("a kit cannot contain itself"));
                }
                if !seen.insert(&component.item_id) {
                    return Err(DomainError::validation(format!(
                        "component {} listed more than once",
                        component.item_id
                    )));
                }
            }
        } else if !self.components.is_empty() {
            return Err(DomainError::validation("only kits have components"));
        }
        Ok(())
    }

    /// Every item id a kit may draw on (primaries and substitutes).
    pub fn component_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.components
            .iter()
            .flat_map(|c| std::iter::once(&c.item_id).chain(c.substitutes.iter()))
    }

    pub fn is_tracked(&self) -> bool {
        self.requires_serial || self.requires_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_item() -> Item {
        Item::create(
            NewItem::new("SKU-1", "Widget")
                .with_id(ItemId::from("widget"))
                .with_thresholds(5, 100, 10, 50),
            CostingMethod::Fifo,
            test_time(),
        )
        .unwrap()
    }

    #[test]
    fn create_validates_fields() {
        let err = Item::create(NewItem::new(" ", "x"), CostingMethod::Fifo, test_time()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = Item::create(
            NewItem::new("S", "x").with_thresholds(10, 5, 0, 0),
            CostingMethod::Fifo,
            test_time(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn default_costing_applies_when_unspecified() {
        let item = Item::create(NewItem::new("S", "x"), CostingMethod::Lifo, test_time()).unwrap();
        assert_eq!(item.costing_method, CostingMethod::Lifo);
    }

    #[test]
    fn referenced_item_only_accepts_threshold_and_price_changes() {
        let mut item = test_item();
        item.apply_update(
            ItemUpdate {
                reorder_point: Some(20),
                cost_price: Some(300),
                ..ItemUpdate::default()
            },
            true,
            test_time(),
        )
        .unwrap();
        assert_eq!(item.reorder_point, 20);

        let before = item.clone();
        let err = item
            .apply_update(
                ItemUpdate {
                    sku: Some("NEW".into()),
                    ..ItemUpdate::default()
                },
                true,
                test_time(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(item, before);
    }

    #[test]
    fn kit_cannot_be_tracked() {
        let mut item = Item::create(
            NewItem::new("KIT", "Kit").with_id(ItemId::from("kit")).serialized(),
            CostingMethod::Fifo,
            test_time(),
        )
        .unwrap();
        let err = item
            .make_kit(vec![KitComponent::new(ItemId::from("a"), 1)], test_time())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(!item.is_kit);
    }

    #[test]
    fn kit_rejects_self_reference_and_duplicates() {
        let mut item = test_item();
        assert!(item
            .make_kit(vec![KitComponent::new(ItemId::from("widget"), 1)], test_time())
            .is_err());
        assert!(item
            .make_kit(
                vec![
                    KitComponent::new(ItemId::from("a"), 1),
                    KitComponent::new(ItemId::from("a"), 2)
                ],
                test_time()
            )
            .is_err());
        item.make_kit(
            vec![
                KitComponent::new(ItemId::from("a"), 1)
                    .with_substitutes(vec![ItemId::from("a2")]),
                KitComponent::new(ItemId::from("b"), 2).optional(),
            ],
            test_time(),
        )
        .unwrap();
        let ids: Vec<_> = item.component_ids().map(|i| i.as_str()).collect();
        assert_eq!(ids, vec!["a", "a2", "b"]);
    }

    #[test]
    fn forecast_model_parses_with_parameters() {
        assert_eq!(
            "moving_average:14".parse::<ForecastModel>(),
            Ok(ForecastModel::MovingAverage { window: 14 })
        );
        assert_eq!(
            "exponential_smoothing".parse::<ForecastModel>(),
            Ok(ForecastModel::ExponentialSmoothing { alpha: 0.3 })
        );
        assert!("exponential_smoothing:1.5".parse::<ForecastModel>().is_err());
        assert!("crystal_ball".parse::<ForecastModel>().is_err());
    }
}
