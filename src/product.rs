//! Canonical product records returned by tool calls, and the lean
//! "simplified" projection for low-token-budget consumers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// kJ per kcal, used when a product only carries `energy` in kilojoules.
const KJ_PER_KCAL: f64 = 4.184;

/// A product row materialized from the snapshot.
///
/// `nutriments` is keyed by nutriment name (see [`crate::normalize`]);
/// `ingredients` is the upstream nested structure, or the raw string when it
/// would not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub code: String,
    pub product_name: String,
    pub brands: String,
    pub nutriments: Map<String, Value>,
    pub link: String,
    pub ingredients: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_quantity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_quantity_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_size: Option<String>,
}

/// Projection of a [`Product`] with redundant energy entries removed and
/// ingredients stripped to identity, text, and estimated percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedProduct {
    pub code: String,
    pub product_name: String,
    pub brands: String,
    pub link: String,
    pub nutriments: Map<String, Value>,
    pub ingredients: Vec<Value>,
}

impl Product {
    /// Builds the simplified projection. Pure: no I/O, deterministic for a
    /// given record.
    pub fn to_simplified(&self) -> SimplifiedProduct {
        SimplifiedProduct {
            code: self.code.clone(),
            product_name: self.product_name.clone(),
            brands: self.brands.clone(),
            link: self.link.clone(),
            nutriments: simplify_nutriments(&self.nutriments),
            ingredients: simplify_ingredients(&self.ingredients),
        }
    }
}

/// Collapses the kJ/kcal duplication: when both `energy` and `energy-kcal`
/// are present the kJ entry is dropped; when only `energy` exists it is
/// converted to kcal. Everything else passes through unchanged.
fn simplify_nutriments(nutriments: &Map<String, Value>) -> Map<String, Value> {
    let has_kcal = nutriments.contains_key("energy-kcal");

    let mut out = Map::new();
    for (name, entry) in nutriments {
        if name == "energy" {
            if has_kcal {
                continue;
            }
            out.insert("energy-kcal".to_string(), energy_to_kcal(entry));
        } else {
            out.insert(name.clone(), entry.clone());
        }
    }
    out
}

fn energy_to_kcal(entry: &Value) -> Value {
    let Value::Object(fields) = entry else {
        return entry.clone();
    };

    let mut converted = fields.clone();
    for key in ["100g", "serving", "value"] {
        if let Some(n) = converted.get(key).and_then(Value::as_f64) {
            converted.insert(key.to_string(), json_number(n / KJ_PER_KCAL));
        }
    }
    converted.insert("name".to_string(), Value::String("energy-kcal".to_string()));
    converted.insert("unit".to_string(), Value::String("kcal".to_string()));
    Value::Object(converted)
}

fn json_number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Reduces each ingredient object to `{id, text, percent_estimate}`. Items
/// missing either `id` or `text` are dropped; non-list input yields an empty
/// list.
fn simplify_ingredients(ingredients: &Value) -> Vec<Value> {
    let Value::Array(items) = ingredients else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let id = obj.get("id")?.as_str()?;
            let text = obj.get("text")?.as_str()?;

            let mut lean = Map::new();
            lean.insert("id".to_string(), Value::String(id.to_string()));
            lean.insert("text".to_string(), Value::String(text.to_string()));
            if let Some(pct) = obj.get("percent_estimate") {
                lean.insert("percent_estimate".to_string(), pct.clone());
            }
            Some(Value::Object(lean))
        })
        .collect()
}
