use serde::{Deserialize, Serialize};

/// One target page of the portal, annotated in place as the pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TargetPage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Label used in log lines: the title when known, else the URL.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// Row upserted into the hosted table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_enhanced_title: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_url: Option<String>,
    pub title_vector: Vec<f32>,
    pub description_vector: Vec<f32>,
}

/// Structured result of a page analysis that also picks a download link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub title: String,
    pub description: String,
    pub primary_data_link: String,
}

/// Structured result of a text-only analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub title: String,
    pub description: String,
}

/// A record the lenient batch driver could not process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPage {
    pub url: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_catalog_json_field_names() {
        let json = r#"{
            "title": "Fire Incidents",
            "url": "https://data.sfgov.org/Public-Safety/Fire-Incidents/wr8u-xric",
            "id": "wr8u-xric",
            "downloadUrl": "https://data.sfgov.org/api/views/wr8u-xric/rows.csv"
        }"#;
        let page: TargetPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.id.as_deref(), Some("wr8u-xric"));
        assert_eq!(
            page.download_url.as_deref(),
            Some("https://data.sfgov.org/api/views/wr8u-xric/rows.csv")
        );
        assert!(page.download_links.is_empty());
        assert!(page.text.is_none());
    }

    #[test]
    fn omits_absent_fields() {
        let page = TargetPage::new("https://data.sfgov.org/d/abcd-1234");
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value, serde_json::json!({ "url": "https://data.sfgov.org/d/abcd-1234" }));
    }

    #[test]
    fn label_prefers_title() {
        let mut page = TargetPage::new("https://example.org/x");
        assert_eq!(page.label(), "https://example.org/x");
        page.title = Some("Parcels".into());
        assert_eq!(page.label(), "Parcels");
    }
}
