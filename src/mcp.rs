//! MCP method semantics over JSON-RPC 2.0: `initialize`, `tools/list`, and
//! `tools/call` with the product-search tool catalog.
//!
//! Framing violations surface as JSON-RPC errors; a bad tool argument never
//! does. Those come back as in-band tool results with `isError: true` so a
//! client's tool loop can show the message to the model instead of tearing
//! down the session.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::{ProductQuery, QueryError};
use crate::product::{Product, SimplifiedProduct};
use crate::rpc::{Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};

/// MCP protocol revision advertised by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
pub const SERVER_NAME: &str = "openfoodfacts-mcp-server";

const DEFAULT_SEARCH_LIMIT: i64 = 3;
const MAX_SEARCH_LIMIT: i64 = 10;

#[derive(Serialize)]
struct SearchProductsResponse {
    found: bool,
    count: usize,
    products: Vec<Product>,
}

#[derive(Serialize)]
struct SearchBarcodeResponse {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<Product>,
}

#[derive(Serialize)]
struct SearchProductsSimplifiedResponse {
    found: bool,
    count: usize,
    products: Vec<SimplifiedProduct>,
}

/// Routes decoded JSON-RPC messages to tool handlers. Shared by both
/// transports; everything inside is behind `Arc`, so cloning is cheap.
pub struct McpDispatcher {
    query: Arc<dyn ProductQuery>,
    development: bool,
    cancel: CancellationToken,
}

impl McpDispatcher {
    pub fn new(query: Arc<dyn ProductQuery>, development: bool, cancel: CancellationToken) -> Self {
        Self {
            query,
            development,
            cancel,
        }
    }

    /// Decodes one wire message and produces at most one response.
    /// Notifications — including unknown ones — are accepted silently.
    pub async fn handle_message(&self, raw: &str) -> Option<Response> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(Response::err(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {e}"),
                ))
            }
        };
        self.handle_value(value).await
    }

    pub async fn handle_value(&self, value: Value) -> Option<Response> {
        if !value.is_object() {
            return Some(Response::err(
                Value::Null,
                INVALID_REQUEST,
                "Invalid request: expected a JSON-RPC object",
            ));
        }
        let req: Request = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(Response::err(
                    Value::Null,
                    INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                ))
            }
        };

        if req.jsonrpc != "2.0" {
            if req.is_notification() {
                return None;
            }
            return Some(Response::err(
                req.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }

        if req.is_notification() {
            debug!(method = %req.method, "notification received");
            return None;
        }

        let id = req.id.clone().unwrap_or(Value::Null);
        if req.method.is_empty() {
            return Some(Response::err(
                id,
                INVALID_REQUEST,
                "Invalid request: missing method",
            ));
        }
        let response = match req.method.as_str() {
            "initialize" => Response::ok(id, self.initialize_result()),
            "tools/list" => Response::ok(id, tools_list_result()),
            "tools/call" => self.tools_call(id, &req.params).await,
            other => {
                warn!(method = other, "method not found");
                Response::err(id, METHOD_NOT_FOUND, "Method not found")
            }
        };
        Some(response)
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn tools_call(&self, id: Value, params: &Value) -> Response {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::err(id, INVALID_PARAMS, "tools/call requires a 'name' parameter");
        };
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        debug!(tool = name, "tools/call");
        let result = match name {
            "search_products_by_brand_and_name" => self.call_search(&args, false).await,
            "search_products_by_brand_and_name_simplified" => self.call_search(&args, true).await,
            "search_by_barcode" => self.call_barcode(&args).await,
            other => return Response::err(id, METHOD_NOT_FOUND, format!("Unknown tool: {other}")),
        };
        Response::ok(id, result)
    }

    async fn call_search(&self, args: &Value, simplified: bool) -> Value {
        let name = match require_string(args, "name") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let brand = match require_string(args, "brand") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let limit = clamp_limit(args.get("limit").and_then(Value::as_f64));

        match self
            .query
            .search_by_brand_and_name(&name, &brand, limit as usize, &self.cancel)
            .await
        {
            Ok(products) if simplified => {
                let products: Vec<SimplifiedProduct> =
                    products.iter().map(Product::to_simplified).collect();
                tool_result(&SearchProductsSimplifiedResponse {
                    found: !products.is_empty(),
                    count: products.len(),
                    products,
                })
            }
            Ok(products) => tool_result(&SearchProductsResponse {
                found: !products.is_empty(),
                count: products.len(),
                products,
            }),
            Err(e) => self.engine_error("Search", e),
        }
    }

    async fn call_barcode(&self, args: &Value) -> Value {
        let barcode = match args.get("barcode").and_then(Value::as_str) {
            Some(b) => b.to_string(),
            None => return tool_error("Missing required parameter 'barcode'"),
        };

        match self.query.search_by_barcode(&barcode, &self.cancel).await {
            Ok(product) => tool_result(&SearchBarcodeResponse {
                found: product.is_some(),
                product,
            }),
            Err(e) => self.engine_error("Barcode search", e),
        }
    }

    /// Engine failures become in-band tool errors. Production deployments
    /// only ever see the generic message; the detail goes to the log.
    fn engine_error(&self, what: &str, e: QueryError) -> Value {
        error!(error = %e, "{what} failed");
        if self.development {
            tool_error(format!("{what} failed: {e}"))
        } else {
            tool_error("internal error")
        }
    }
}

fn require_string(args: &Value, key: &str) -> Result<String, Value> {
    let Some(value) = args.get(key).and_then(Value::as_str) else {
        return Err(tool_error(format!("Missing required parameter '{key}'")));
    };
    if value.is_empty() {
        return Err(tool_error(format!(
            "Parameter '{key}' must be at least 1 character long"
        )));
    }
    Ok(value.to_string())
}

/// Out-of-range limits clamp rather than error: non-positive values fall
/// back to the default, anything above the ceiling is capped.
fn clamp_limit(limit: Option<f64>) -> i64 {
    let limit = limit.map(|f| f as i64).unwrap_or(DEFAULT_SEARCH_LIMIT);
    if limit <= 0 {
        DEFAULT_SEARCH_LIMIT
    } else {
        limit.min(MAX_SEARCH_LIMIT)
    }
}

/// Success envelope: machine-readable `structuredContent` plus the same
/// payload as indented JSON text for clients that only render text.
fn tool_result(payload: &impl Serialize) -> Value {
    let structured = serde_json::to_value(payload).unwrap_or(Value::Null);
    let text = serde_json::to_string_pretty(&structured).unwrap_or_default();
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false,
        "structuredContent": structured,
    })
}

fn tool_error(message: impl Into<String>) -> Value {
    json!({
        "isError": true,
        "content": [{ "type": "text", "text": message.into() }],
    })
}

/// The fixed tool catalog. Tools are declared idempotent; descriptors carry
/// both input and output JSON Schemas for clients that validate.
fn tools_list_result() -> Value {
    let product_schema = json!({
        "type": "object",
        "properties": {
            "code": { "type": "string" },
            "product_name": { "type": "string" },
            "brands": { "type": "string" },
            "nutriments": { "type": "object" },
            "link": { "type": "string" },
            "ingredients": {},
            "serving_quantity": {},
            "serving_quantity_unit": { "type": "string" },
            "serving_size": { "type": "string" }
        },
        "required": ["code", "product_name", "brands"]
    });

    let search_input = json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "minLength": 1,
                "description": "Product name to search for. Required and must be a non-empty string."
            },
            "brand": {
                "type": "string",
                "minLength": 1,
                "description": "Brand name to search for. Required and must be a non-empty string."
            },
            "limit": {
                "type": "number",
                "minimum": 1,
                "maximum": MAX_SEARCH_LIMIT,
                "default": DEFAULT_SEARCH_LIMIT,
                "description": "Maximum number of results (default: 3, max: 10)"
            }
        },
        "required": ["name", "brand"]
    });

    json!({
        "tools": [
            {
                "name": "search_products_by_brand_and_name",
                "description": "Search for branded products by their brand and product name. This tool can only be used if brand and product name are both provided and non-empty.",
                "inputSchema": search_input,
                "outputSchema": {
                    "type": "object",
                    "properties": {
                        "found": { "type": "boolean" },
                        "count": { "type": "integer" },
                        "products": { "type": "array", "items": product_schema }
                    },
                    "required": ["found", "count", "products"]
                },
                "annotations": { "idempotentHint": true, "readOnlyHint": true }
            },
            {
                "name": "search_by_barcode",
                "description": "Search for a product by its barcode (UPC/EAN)",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "barcode": {
                            "type": "string",
                            "description": "The barcode (UPC/EAN) to search for"
                        }
                    },
                    "required": ["barcode"]
                },
                "outputSchema": {
                    "type": "object",
                    "properties": {
                        "found": { "type": "boolean" },
                        "product": product_schema
                    },
                    "required": ["found"]
                },
                "annotations": { "idempotentHint": true, "readOnlyHint": true }
            },
            {
                "name": "search_products_by_brand_and_name_simplified",
                "description": "Search for branded products by their brand and product name returning simplified nutrients. This tool can only be used if brand and product name are both provided and non-empty.",
                "inputSchema": search_input,
                "outputSchema": {
                    "type": "object",
                    "properties": {
                        "found": { "type": "boolean" },
                        "count": { "type": "integer" },
                        "products": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "code": { "type": "string" },
                                    "product_name": { "type": "string" },
                                    "brands": { "type": "string" },
                                    "link": { "type": "string" },
                                    "nutriments": { "type": "object" },
                                    "ingredients": { "type": "array" }
                                },
                                "required": ["code", "product_name", "brands"]
                            }
                        }
                    },
                    "required": ["found", "count", "products"]
                },
                "annotations": { "idempotentHint": true, "readOnlyHint": true }
            }
        ]
    })
}
