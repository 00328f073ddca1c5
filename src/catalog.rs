use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

/// One catalog entry. Owned by the catalog collaborator; read-only to
/// the pipeline apart from the view counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub shape: String,
    pub color_front: String,
    #[serde(default)]
    pub color_back: Option<String>,
    #[serde(default)]
    pub imprint_front: Option<String>,
    #[serde(default)]
    pub imprint_back: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub view_count: u64,
}

impl CatalogRecord {
    pub fn matches_color(&self, color: &str) -> bool {
        self.color_front.contains(color)
            || self
                .color_back
                .as_deref()
                .is_some_and(|back| back.contains(color))
    }

    pub fn matches_imprint(&self, text: &str) -> bool {
        self.imprint_front
            .as_deref()
            .is_some_and(|front| front.contains(text))
            || self
                .imprint_back
                .as_deref()
                .is_some_and(|back| back.contains(text))
    }

    pub fn has_imprint(&self) -> bool {
        self.imprint_front.as_deref().is_some_and(|front| !front.is_empty())
            || self.imprint_back.as_deref().is_some_and(|back| !back.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub keyword: Option<String>,
    pub shape: Option<String>,
    pub color: Option<String>,
    pub imprint: Option<String>,
    pub manufacturer: Option<String>,
    pub sort: Option<SortOrder>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Popular,
    Recent,
    Name,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub items: Vec<CatalogRecord>,
}

/// Narrow interface to the relational catalog. Implementations must be
/// safe for concurrent read-mostly access; the view counter is the only
/// mutation the pipeline performs.
pub trait CatalogStore: Send + Sync {
    fn find_by_imprint_and_color(&self, text: &str, color: &str) -> Result<Vec<CatalogRecord>>;
    fn find_by_imprint(&self, text: &str) -> Result<Vec<CatalogRecord>>;
    fn find_by_color(&self, color: &str) -> Result<Vec<CatalogRecord>>;
    fn search(&self, query: &SearchQuery) -> Result<SearchPage>;
    fn get(&self, id: &str) -> Result<Option<CatalogRecord>>;
    fn increment_view_count(&self, id: &str) -> Result<()>;
    /// Toggle a like; returns whether the record is liked afterwards.
    fn record_like(&self, user_id: &str, id: &str) -> Result<bool>;
}

/// Catalog backed by a JSON snapshot held in memory. Stands in for the
/// relational store in the binary and in tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: RwLock<Vec<CatalogRecord>>,
    likes: RwLock<HashSet<(String, String)>>,
}

impl InMemoryCatalog {
    pub fn from_records(records: Vec<CatalogRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            likes: RwLock::new(HashSet::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file: {}", path.display()))?;
        let records: Vec<CatalogRecord> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse catalog file: {}", path.display()))?;
        Ok(Self::from_records(records))
    }

    fn filtered<F>(&self, keep: F) -> Vec<CatalogRecord>
    where
        F: Fn(&CatalogRecord) -> bool,
    {
        self.records
            .read()
            .expect("catalog lock poisoned")
            .iter()
            .filter(|record| keep(record))
            .cloned()
            .collect()
    }
}

impl CatalogStore for InMemoryCatalog {
    fn find_by_imprint_and_color(&self, text: &str, color: &str) -> Result<Vec<CatalogRecord>> {
        Ok(self.filtered(|record| record.matches_imprint(text) && record.matches_color(color)))
    }

    fn find_by_imprint(&self, text: &str) -> Result<Vec<CatalogRecord>> {
        Ok(self.filtered(|record| record.matches_imprint(text)))
    }

    fn find_by_color(&self, color: &str) -> Result<Vec<CatalogRecord>> {
        Ok(self.filtered(|record| record.matches_color(color)))
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let mut items = self.filtered(|record| {
            let keyword_hit = query.keyword.as_deref().is_none_or(|keyword| {
                record.name.contains(keyword) || record.manufacturer.contains(keyword)
            });
            let shape_hit = query
                .shape
                .as_deref()
                .is_none_or(|shape| record.shape == shape);
            let color_hit = query
                .color
                .as_deref()
                .is_none_or(|color| record.matches_color(color));
            let imprint_hit = query
                .imprint
                .as_deref()
                .is_none_or(|imprint| record.matches_imprint(imprint));
            let manufacturer_hit = query
                .manufacturer
                .as_deref()
                .is_none_or(|manufacturer| record.manufacturer.contains(manufacturer));
            keyword_hit && shape_hit && color_hit && imprint_hit && manufacturer_hit
        });

        match query.sort.unwrap_or_default() {
            SortOrder::Popular => items.sort_by(|a, b| {
                b.view_count
                    .cmp(&a.view_count)
                    .then_with(|| a.name.cmp(&b.name))
            }),
            SortOrder::Recent => items.sort_by(|a, b| b.id.cmp(&a.id)),
            SortOrder::Name => items.sort_by(|a, b| a.name.cmp(&b.name)),
        }

        // page is 1-based; the HTTP surface rejects 0 before this runs.
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(20).clamp(1, 100);
        let total = items.len();
        let start = (page - 1).saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);
        Ok(SearchPage {
            page,
            page_size,
            total,
            items: items[start..end].to_vec(),
        })
    }

    fn get(&self, id: &str) -> Result<Option<CatalogRecord>> {
        Ok(self
            .records
            .read()
            .expect("catalog lock poisoned")
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    fn increment_view_count(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().expect("catalog lock poisoned");
        if let Some(record) = records.iter_mut().find(|record| record.id == id) {
            record.view_count += 1;
        }
        Ok(())
    }

    fn record_like(&self, user_id: &str, id: &str) -> Result<bool> {
        let mut likes = self.likes.write().expect("catalog lock poisoned");
        let key = (user_id.to_string(), id.to_string());
        if likes.remove(&key) {
            Ok(false)
        } else {
            likes.insert(key);
            Ok(true)
        }
    }
}

#[cfg(test)]
pub(crate) fn record(
    id: &str,
    name: &str,
    color: &str,
    imprint: Option<&str>,
    view_count: u64,
) -> CatalogRecord {
    CatalogRecord {
        id: id.to_string(),
        name: name.to_string(),
        manufacturer: "Acme Pharma".to_string(),
        shape: "round".to_string(),
        color_front: color.to_string(),
        color_back: None,
        imprint_front: imprint.map(|text| text.to_string()),
        imprint_back: None,
        image_url: None,
        view_count,
    }
}
