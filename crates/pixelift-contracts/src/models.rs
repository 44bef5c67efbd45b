use indexmap::IndexMap;
use serde_json::{Map, Value};

/// A pinned hosted-model reference for one studio operation.
///
/// References follow the hosted API's `owner/name:version` form; chat-style
/// models are unversioned (`owner/name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub capability: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, capability: &str) -> Option<&ModelSpec> {
        self.models.get(capability)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn resolve(&self, capability: &str) -> Result<String, String> {
        self.get(capability)
            .map(|spec| spec.model.clone())
            .ok_or_else(|| format!("No model pinned for operation '{capability}'."))
    }

    /// Replaces pinned references from a JSON object of
    /// `capability -> model reference` pairs. Non-string values are ignored.
    pub fn apply_overrides(&mut self, overrides: &Map<String, Value>) {
        for (capability, value) in overrides {
            let Some(model) = value.as_str().map(str::trim).filter(|item| !item.is_empty())
            else {
                continue;
            };
            self.models.insert(
                capability.clone(),
                ModelSpec {
                    capability: capability.clone(),
                    model: model.to_string(),
                },
            );
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |capability: &str, model: &str| {
        map.insert(
            capability.to_string(),
            ModelSpec {
                capability: capability.to_string(),
                model: model.to_string(),
            },
        );
    };

    insert(
        "restore",
        "tencentarc/gfpgan:0fbacf7afc6c144e5be9767cff80f25aff23e52b0708f17e20f9879b2f21516c",
    );
    insert(
        "generate",
        "bytedance/sdxl-lightning-4step:5599ed30703defd1d160a25a63321b4dec97101d98b4674bcc56e41f62f35637",
    );
    insert(
        "transform",
        "timothybrooks/instruct-pix2pix:30c1d0b916a6f8efce20493f5d61ee27491ab2a60437c13c588468b9810ec23f",
    );
    insert(
        "sticker",
        "fofr/face-to-sticker:764d4827ea159608a07cdde8ddf1c6000019627515eb02b6b449695fd547e5ef",
    );
    insert(
        "enhance",
        "sczhou/codeformer:7de2ea26c616d5bf2245ad0d5e24f0ff9a6204578a5c876db53142edd9d2cd56",
    );
    insert("chat", "meta/meta-llama-3-8b-instruct");

    map
}
