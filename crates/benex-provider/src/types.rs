//! Wire-format types for provider responses.

use serde_json::Value;

use crate::error::ProviderError;

/// A searchset bundle page, reduced to what the export pipeline needs:
/// the resources themselves and the continuation link, if any.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    /// The `entry[].resource` objects, in page order.
    pub entries: Vec<Value>,
    /// Absolute URL of the next page, when the provider paginated.
    pub next_url: Option<String>,
}

impl Bundle {
    /// Parses one bundle page from its JSON body.
    pub fn from_value(body: &Value) -> Result<Bundle, ProviderError> {
        if body.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(ProviderError::MalformedBundle(
                "response is not a Bundle resource".into(),
            ));
        }

        let mut entries = Vec::new();
        if let Some(raw) = body.get("entry") {
            let list = raw.as_array().ok_or_else(|| {
                ProviderError::MalformedBundle("bundle entry is not an array".into())
            })?;
            for item in list {
                match item.get("resource") {
                    Some(resource) => entries.push(resource.clone()),
                    None => {
                        return Err(ProviderError::MalformedBundle(
                            "bundle entry has no resource".into(),
                        ));
                    }
                }
            }
        }

        Ok(Bundle {
            entries,
            next_url: next_link(body),
        })
    }

    /// Appends another page's entries onto this bundle and adopts its
    /// continuation link.
    pub fn absorb(&mut self, page: Bundle) {
        self.entries.extend(page.entries);
        self.next_url = page.next_url;
    }
}

fn next_link(body: &Value) -> Option<String> {
    body.get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url").and_then(Value::as_str))
        .map(str::to_string)
}
