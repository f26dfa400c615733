//! # Sample Schemas
//!
//! A small operational data store (`ods`) and a reporting snapshot, used by
//! the tests and the `seed` binary.
//!
//! ## ODS Tables
//! ```text
//! ┌─────────────────────────┐         ┌──────────────────────────────┐
//! │ asset_hierarchy_level   │ 1     * │ bridge_asset_hierarchy       │
//! │─────────────────────────│◄────────│──────────────────────────────│
//! │ asset_hierarchy_level_key│        │ bridge_key                   │
//! │ name, level             │         │ parent_key, child_key        │
//! └─────────────────────────┘         │ fund_key ──────────┐         │
//!                                     │ created_by, ...    │         │
//! ┌─────────────────────────┐         └────────────────────┼─────────┘
//! │ dim_entity              │                              │ *
//! │ entity_key, target_key  │         ┌────────────────────▼─────────┐
//! │ target_type             │         │ dim_fund (fund_key TEXT PK)  │
//! └─────────────────────────┘         └──────────────────────────────┘
//! ```

use keel_core::{Entity, Relation, Value};
use serde::{Deserialize, Serialize};

use crate::schema::Schema;

// =============================================================================
// Schemas
// =============================================================================

/// Operational data store tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct OdsSchema;

impl Schema for OdsSchema {
    const NAME: &'static str = "ods";
    const STATEMENTS: &'static [&'static str] = &[
        "CREATE TABLE IF NOT EXISTS asset_hierarchy_level (
            asset_hierarchy_level_key INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            level INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS dim_fund (
            fund_key TEXT PRIMARY KEY NOT NULL,
            fund_name TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS dim_entity (
            entity_key INTEGER PRIMARY KEY,
            target_key INTEGER NOT NULL,
            target_type TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS bridge_asset_hierarchy (
            bridge_key INTEGER PRIMARY KEY,
            parent_key INTEGER NOT NULL,
            child_key INTEGER NOT NULL,
            fund_key TEXT REFERENCES dim_fund (fund_key),
            asset_hierarchy_level_key INTEGER NOT NULL
                REFERENCES asset_hierarchy_level (asset_hierarchy_level_key),
            created_by TEXT NOT NULL,
            modified_by TEXT NOT NULL
        )",
    ];
}

/// Reporting snapshot tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotSchema;

impl Schema for SnapshotSchema {
    const NAME: &'static str = "snapshot";
    const STATEMENTS: &'static [&'static str] = &["CREATE TABLE IF NOT EXISTS view_country (
            code TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            currency_code TEXT NOT NULL
        )"];
}

// =============================================================================
// ODS Entities
// =============================================================================

/// One level of the asset hierarchy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssetHierarchyLevel {
    pub asset_hierarchy_level_key: i64,
    pub name: String,
    pub level: i64,

    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridges: Vec<BridgeAssetHierarchy>,
}

impl AssetHierarchyLevel {
    /// An unsaved level; the key is assigned on insert.
    pub fn new(name: impl Into<String>, level: i64) -> Self {
        AssetHierarchyLevel {
            name: name.into(),
            level,
            ..Default::default()
        }
    }

    /// Bridges defined at this level.
    pub fn bridges() -> Relation<AssetHierarchyLevel, BridgeAssetHierarchy> {
        Relation::has_many(
            "bridges",
            "asset_hierarchy_level_key",
            |b| b.asset_hierarchy_level_key.into(),
            |level, bridges| level.bridges = bridges,
        )
    }
}

impl Entity for AssetHierarchyLevel {
    const TABLE: &'static str = "asset_hierarchy_level";
    const KEY: &'static str = "asset_hierarchy_level_key";
    const KEY_GENERATED: bool = true;
    const COLUMNS: &'static [&'static str] = &["asset_hierarchy_level_key", "name", "level"];

    fn key(&self) -> Value {
        self.asset_hierarchy_level_key.into()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.asset_hierarchy_level_key.into(),
            self.name.as_str().into(),
            self.level.into(),
        ]
    }

    fn from_key(key: Value) -> Option<Self> {
        Some(AssetHierarchyLevel {
            asset_hierarchy_level_key: key.as_i64()?,
            ..Default::default()
        })
    }
}

/// A parent/child edge of the hierarchy, scoped to a fund.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct BridgeAssetHierarchy {
    pub bridge_key: i64,
    pub parent_key: i64,
    pub child_key: i64,
    pub fund_key: Option<String>,
    pub asset_hierarchy_level_key: i64,
    pub created_by: String,
    pub modified_by: String,

    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund: Option<DimFund>,
}

impl BridgeAssetHierarchy {
    pub fn fund() -> Relation<BridgeAssetHierarchy, DimFund> {
        Relation::belongs_to(
            "fund",
            |b| b.fund_key.clone().into(),
            |bridge, fund| bridge.fund = fund,
        )
    }
}

impl Entity for BridgeAssetHierarchy {
    const TABLE: &'static str = "bridge_asset_hierarchy";
    const KEY: &'static str = "bridge_key";
    const KEY_GENERATED: bool = true;
    const COLUMNS: &'static [&'static str] = &[
        "bridge_key",
        "parent_key",
        "child_key",
        "fund_key",
        "asset_hierarchy_level_key",
        "created_by",
        "modified_by",
    ];

    fn key(&self) -> Value {
        self.bridge_key.into()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.bridge_key.into(),
            self.parent_key.into(),
            self.child_key.into(),
            self.fund_key.clone().into(),
            self.asset_hierarchy_level_key.into(),
            self.created_by.as_str().into(),
            self.modified_by.as_str().into(),
        ]
    }

    fn from_key(key: Value) -> Option<Self> {
        Some(BridgeAssetHierarchy {
            bridge_key: key.as_i64()?,
            ..Default::default()
        })
    }
}

/// Fund dimension with a natural text key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimFund {
    pub fund_key: String,
    pub fund_name: String,
}

impl DimFund {
    pub fn new(fund_key: impl Into<String>, fund_name: impl Into<String>) -> Self {
        DimFund {
            fund_key: fund_key.into(),
            fund_name: fund_name.into(),
        }
    }
}

impl Entity for DimFund {
    const TABLE: &'static str = "dim_fund";
    const KEY: &'static str = "fund_key";
    const COLUMNS: &'static [&'static str] = &["fund_key", "fund_name"];

    fn key(&self) -> Value {
        self.fund_key.as_str().into()
    }

    fn values(&self) -> Vec<Value> {
        vec![self.fund_key.as_str().into(), self.fund_name.as_str().into()]
    }

    fn from_key(key: Value) -> Option<Self> {
        Some(DimFund {
            fund_key: key.as_str()?.to_string(),
            ..Default::default()
        })
    }
}

/// Generic entity dimension. Has no key-only placeholder, so deletes by
/// key read the row first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimEntity {
    pub entity_key: i64,
    pub target_key: i64,
    pub target_type: String,
}

impl DimEntity {
    pub fn new(target_key: i64, target_type: impl Into<String>) -> Self {
        DimEntity {
            entity_key: 0,
            target_key,
            target_type: target_type.into(),
        }
    }
}

impl Entity for DimEntity {
    const TABLE: &'static str = "dim_entity";
    const KEY: &'static str = "entity_key";
    const KEY_GENERATED: bool = true;
    const COLUMNS: &'static [&'static str] = &["entity_key", "target_key", "target_type"];

    fn key(&self) -> Value {
        self.entity_key.into()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.entity_key.into(),
            self.target_key.into(),
            self.target_type.as_str().into(),
        ]
    }
}

// =============================================================================
// Snapshot Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct ViewCountry {
    pub code: String,
    pub name: String,
    pub currency_code: String,
}

impl ViewCountry {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        currency_code: impl Into<String>,
    ) -> Self {
        ViewCountry {
            code: code.into(),
            name: name.into(),
            currency_code: currency_code.into(),
        }
    }
}

impl Entity for ViewCountry {
    const TABLE: &'static str = "view_country";
    const KEY: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["code", "name", "currency_code"];

    fn key(&self) -> Value {
        self.code.as_str().into()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.code.as_str().into(),
            self.name.as_str().into(),
            self.currency_code.as_str().into(),
        ]
    }
}

// =============================================================================
// Seed Data
// =============================================================================

/// Nine hierarchy levels, unsaved.
pub fn levels() -> Vec<AssetHierarchyLevel> {
    (1..=9)
        .map(|n| AssetHierarchyLevel::new(format!("AssetHierarchyLevel {}", n), n))
        .collect()
}

pub fn funds() -> Vec<DimFund> {
    vec![
        DimFund::new("Unknown", "Unknown"),
        DimFund::new("Fund1", "AustralianSuper"),
    ]
}

/// Seven entities: three currency classifications, then four sub asset
/// classes.
pub fn entities() -> Vec<DimEntity> {
    (0..7)
        .map(|k| {
            let target_type = if k < 3 {
                "DimCurrencyClassification"
            } else {
                "Sub Asset Class"
            };
            DimEntity::new(k, target_type)
        })
        .collect()
}

/// Bridges between the seeded entities, all on level 1 of `Fund1`.
///
/// Assumes levels and entities were inserted first into empty tables, so
/// their generated keys start at 1.
pub fn bridges() -> Vec<BridgeAssetHierarchy> {
    [(1, 2), (1, 3), (4, 5), (4, 6), (4, 7)]
        .into_iter()
        .map(|(parent_key, child_key)| BridgeAssetHierarchy {
            bridge_key: 0,
            parent_key,
            child_key,
            fund_key: Some("Fund1".to_string()),
            asset_hierarchy_level_key: 1,
            created_by: "user".to_string(),
            modified_by: "user".to_string(),
            fund: None,
        })
        .collect()
}
