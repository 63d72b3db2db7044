//! Product catalog: the ordered step templates each product requires.
//!
//! The catalog is external configuration. The engine reads it to know which
//! fields and documents a step expects, and never mutates it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{DocumentTypeId, FieldId, ProductId, StepActor, StepTemplateId};

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Catalog parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Duplicate product id: {0}")]
    DuplicateProduct(ProductId),
    #[error("Product {0} has no steps")]
    EmptyProduct(ProductId),
    #[error("Product {product} reuses step id {step}")]
    DuplicateStep { product: ProductId, step: StepTemplateId },
    #[error("Product {product} has two steps at position {position}")]
    DuplicatePosition { product: ProductId, position: u32 },
    #[error("Step {step} declares field key {key} twice")]
    DuplicateFieldKey { step: StepTemplateId, key: String },
    #[error("Step {step} requires unknown document type {document_type}")]
    UnknownDocumentType {
        step: StepTemplateId,
        document_type: DocumentTypeId,
    },
    #[error("Field {field} has an invalid pattern: {reason}")]
    InvalidPattern { field: FieldId, reason: String },
}

/// Expected shape of a submitted field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text {
        #[serde(default)]
        pattern: Option<String>,
    },
    Email,
    Number,
    Boolean,
    /// Calendar date as `YYYY-MM-DD`.
    Date,
    Select {
        options: Vec<String>,
    },
    Json,
}

impl FieldKind {
    pub fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        use serde_json::Value;

        match (self, value) {
            (FieldKind::Json, _) => Ok(()),
            (FieldKind::Text { pattern }, Value::String(s)) => {
                if s.trim().is_empty() {
                    return Err("text value is empty".to_string());
                }
                match pattern {
                    Some(p) => {
                        let re = Regex::new(p).map_err(|e| e.to_string())?;
                        if re.is_match(s) {
                            Ok(())
                        } else {
                            Err(format!("value does not match pattern {p}"))
                        }
                    }
                    None => Ok(()),
                }
            }
            (FieldKind::Email, Value::String(s)) => match EMAIL.as_ref() {
                Some(re) if re.is_match(s) => Ok(()),
                _ => Err(format!("{s} is not an email address")),
            },
            (FieldKind::Number, Value::Number(_)) => Ok(()),
            (FieldKind::Boolean, Value::Bool(_)) => Ok(()),
            (FieldKind::Date, Value::String(s)) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| format!("{s} is not a YYYY-MM-DD date")),
            (FieldKind::Select { options }, Value::String(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(format!("{s} is not one of {options:?}"))
                }
            }
            (kind, other) => Err(format!("{other} is not a valid {kind:?} value")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: FieldId,
    pub key: String,
    pub label: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentType {
    pub id: DocumentTypeId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: StepTemplateId,
    pub label: String,
    pub position: u32,
    pub actor: StepActor,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub required_document_types: Vec<DocumentTypeId>,
}

impl StepTemplate {
    pub fn field(&self, id: &FieldId) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| &f.id == id)
    }

    pub fn field_by_key(&self, key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn required_field_ids(&self) -> Vec<FieldId> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub steps: Vec<StepTemplate>,
}

impl Product {
    /// Steps in template order. Sorted once when the catalog is built.
    pub fn ordered_steps(&self) -> &[StepTemplate] {
        &self.steps
    }

    pub fn step(&self, id: &StepTemplateId) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn first_step(&self) -> Option<&StepTemplate> {
        self.steps.first()
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    document_types: Vec<DocumentType>,
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: HashMap<ProductId, Product>,
    document_types: HashMap<DocumentTypeId, DocumentType>,
}

impl ProductCatalog {
    pub fn new(
        products: Vec<Product>,
        document_types: Vec<DocumentType>,
    ) -> Result<Self, CatalogError> {
        let document_types: HashMap<_, _> = document_types
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        let mut by_id = HashMap::new();
        for mut product in products {
            validate_product(&product, &document_types)?;
            product.steps.sort_by_key(|s| s.position);
            if by_id.contains_key(&product.id) {
                return Err(CatalogError::DuplicateProduct(product.id));
            }
            by_id.insert(product.id.clone(), product);
        }

        Ok(Self {
            products: by_id,
            document_types,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(content)?;
        Self::new(file.products, file.document_types)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn product(&self, id: &ProductId) -> WorkflowResult<&Product> {
        self.products
            .get(id)
            .ok_or_else(|| WorkflowError::not_found("product", id))
    }

    pub fn step_template(
        &self,
        product_id: &ProductId,
        step_id: &StepTemplateId,
    ) -> WorkflowResult<&StepTemplate> {
        self.product(product_id)?
            .step(step_id)
            .ok_or_else(|| WorkflowError::not_found("step template", step_id))
    }

    pub fn document_type(&self, id: &DocumentTypeId) -> Option<&DocumentType> {
        self.document_types.get(id)
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }
}

fn validate_product(
    product: &Product,
    document_types: &HashMap<DocumentTypeId, DocumentType>,
) -> Result<(), CatalogError> {
    if product.steps.is_empty() {
        return Err(CatalogError::EmptyProduct(product.id.clone()));
    }

    let mut step_ids = HashSet::new();
    let mut positions = HashSet::new();
    for step in &product.steps {
        if !step_ids.insert(&step.id) {
            return Err(CatalogError::DuplicateStep {
                product: product.id.clone(),
                step: step.id.clone(),
            });
        }
        if !positions.insert(step.position) {
            return Err(CatalogError::DuplicatePosition {
                product: product.id.clone(),
                position: step.position,
            });
        }

        let mut keys = HashSet::new();
        for field in &step.fields {
            if !keys.insert(field.key.as_str()) {
                return Err(CatalogError::DuplicateFieldKey {
                    step: step.id.clone(),
                    key: field.key.clone(),
                });
            }
            if let FieldKind::Text {
                pattern: Some(pattern),
            } = &field.kind
            {
                Regex::new(pattern).map_err(|e| CatalogError::InvalidPattern {
                    field: field.id.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        for doc_type in &step.required_document_types {
            if !document_types.contains_key(doc_type) {
                return Err(CatalogError::UnknownDocumentType {
                    step: step.id.clone(),
                    document_type: doc_type.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CATALOG: &str = r#"
[[document_types]]
id = "passport"
label = "Passport"

[[products]]
id = "llc-formation"
name = "LLC Formation"

[[products.steps]]
id = "company"
label = "Company details"
position = 2
actor = "CLIENT"

[[products.steps.fields]]
id = "company_name"
key = "company_name"
label = "Company name"
kind = { type = "text", pattern = "LLC$" }
required = true

[[products.steps]]
id = "identity"
label = "Identity"
position = 1
actor = "CLIENT"
required_document_types = ["passport"]

[[products.steps.fields]]
id = "email"
key = "email"
label = "Email"
kind = { type = "email" }
"#;

    #[test]
    fn test_catalog_orders_steps_by_position() {
        let catalog = ProductCatalog::from_toml_str(CATALOG).unwrap();
        let product = catalog.product(&ProductId::from("llc-formation")).unwrap();
        let ids: Vec<_> = product.ordered_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["identity", "company"]);
        assert_eq!(product.first_step().unwrap().required_document_types.len(), 1);
    }

    #[test]
    fn test_unknown_document_type_rejected() {
        let broken = CATALOG.replace(r#"["passport"]"#, r#"["visa"]"#);
        assert!(matches!(
            ProductCatalog::from_toml_str(&broken),
            Err(CatalogError::UnknownDocumentType { .. })
        ));
    }

    #[test]
    fn test_duplicate_position_rejected() {
        let broken = CATALOG.replace("position = 2", "position = 1");
        assert!(matches!(
            ProductCatalog::from_toml_str(&broken),
            Err(CatalogError::DuplicatePosition { .. })
        ));
    }

    #[test]
    fn test_unknown_product_is_not_found() {
        let catalog = ProductCatalog::from_toml_str(CATALOG).unwrap();
        assert!(matches!(
            catalog.product(&ProductId::from("nope")),
            Err(WorkflowError::NotFound { .. })
        ));
    }

    #[test]
    fn test_field_kinds_validate_values() {
        let text = FieldKind::Text {
            pattern: Some("LLC$".to_string()),
        };
        assert!(text.validate(&json!("Acme LLC")).is_ok());
        assert!(text.validate(&json!("Acme Inc")).is_err());
        assert!(FieldKind::Email.validate(&json!("a@b.co")).is_ok());
        assert!(FieldKind::Email.validate(&json!("nope")).is_err());
        assert!(FieldKind::Date.validate(&json!("2024-02-29")).is_ok());
        assert!(FieldKind::Date.validate(&json!("2023-02-29")).is_err());
        assert!(FieldKind::Number.validate(&json!("12")).is_err());
        let select = FieldKind::Select {
            options: vec!["single".to_string(), "multi".to_string()],
        };
        assert!(select.validate(&json!("multi")).is_ok());
        assert!(select.validate(&json!("other")).is_err());
        assert!(FieldKind::Json.validate(&json!({"any": [1, 2]})).is_ok());
    }
}
