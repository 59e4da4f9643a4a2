//! Infrastructure templates and the catalog that serves them

pub mod parser;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::parameter::ParameterDefinition;

pub use parser::parse_template;

/// A parsed infrastructure template
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    /// Source written to the working directory as-is
    pub content: String,
    /// Declared variables, in declaration order
    pub parameters: Vec<ParameterDefinition>,
    /// Declared `type.name` resource and `module.name` addresses
    pub resources: Vec<String>,
}

impl Template {
    pub fn definition(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Whether a state address belongs to something this template declares
    pub fn declares(&self, address: &str) -> bool {
        let base = base_address(address);
        if let Some(rest) = base.strip_prefix("module.") {
            let module = rest.split('.').next().unwrap_or_default();
            return self
                .resources
                .iter()
                .any(|r| r.strip_prefix("module.") == Some(module));
        }
        self.resources.iter().any(|r| *r == base)
    }
}

/// Strip instance keys (`[0]`, `["a"]`) from a state address
pub fn base_address(address: &str) -> String {
    let mut out = String::with_capacity(address.len());
    let mut depth = 0usize;
    for c in address.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Data sources are read, never created
pub fn is_data_source(address: &str) -> bool {
    let base = base_address(address);
    let mut segments = base.split('.').peekable();
    loop {
        match segments.next() {
            Some("module") => {
                segments.next();
            }
            Some("data") => return true,
            _ => return false,
        }
    }
}

/// Source of templates by id
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get(&self, template_id: &str) -> Result<Template, AgentError>;

    async fn list(&self) -> Result<Vec<String>, AgentError>;
}

fn validate_template_id(template_id: &str) -> Result<(), AgentError> {
    let valid = !template_id.is_empty()
        && template_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(AgentError::ConfigError(format!(
            "invalid template id '{}'",
            template_id
        )));
    }
    Ok(())
}

/// Catalog backed by `<dir>/<id>.tf` files
#[derive(Debug, Clone)]
pub struct FsTemplateCatalog {
    dir: Dir,
}

impl FsTemplateCatalog {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl TemplateCatalog for FsTemplateCatalog {
    async fn get(&self, template_id: &str) -> Result<Template, AgentError> {
        validate_template_id(template_id)?;
        let file = self.dir.file(&format!("{}.tf", template_id));
        let content = file.read_string_opt().await?.ok_or_else(|| {
            AgentError::ConfigError(format!("unknown template '{}'", template_id))
        })?;
        parse_template(template_id, &content)
    }

    async fn list(&self) -> Result<Vec<String>, AgentError> {
        let files = self.dir.list_files().await?;
        Ok(files
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("tf"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect())
    }
}

/// In-memory catalog, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryTemplateCatalog {
    templates: RwLock<HashMap<String, Template>>,
}

impl MemoryTemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template: Template) {
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.insert(template.id.clone(), template);
    }

    /// Parse and insert template source
    pub fn insert_source(&self, template_id: &str, content: &str) -> Result<(), AgentError> {
        validate_template_id(template_id)?;
        self.insert(parse_template(template_id, content)?);
        Ok(())
    }
}

#[async_trait]
impl TemplateCatalog for MemoryTemplateCatalog {
    async fn get(&self, template_id: &str) -> Result<Template, AgentError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| AgentError::ConfigError(format!("unknown template '{}'", template_id)))
    }

    async fn list(&self) -> Result<Vec<String>, AgentError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = templates.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
