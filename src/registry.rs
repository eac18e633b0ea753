//! Static catalog of generation tools and the workflow templates that chain
//! them.

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::conf::ConfPricing;

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Image,
    Video,
    Audio,
    #[serde(rename = "3d")]
    ThreeD,
}

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Url,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Tool {
    pub id: &'static str,
    pub name: &'static str,
    pub category: Category,
    /// Provider model path, e.g. `fal-ai/flux/schnell`.
    pub model: &'static str,
    /// Provider cost per call in micro-USD.
    pub base_cost: u64,
    pub timeout: Option<Duration>,
    pub fields: &'static [Field],
}

#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub tool: &'static str,
    /// Input key that receives the previous step's media URL.
    pub from_previous: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct Workflow {
    pub id: &'static str,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
    pub steps: &'static [Step],
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("input must be a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("field {field} must be a {expected:?}")]
    WrongKind {
        field: &'static str,
        expected: FieldKind,
    },

    #[error("field {0} must be an http(s) or data URL")]
    BadUrl(&'static str),
}

const PROMPT: Field = Field {
    name: "prompt",
    kind: FieldKind::String,
    required: true,
    description: "What to generate.",
};

const IMAGE_URL: Field = Field {
    name: "image_url",
    kind: FieldKind::Url,
    required: true,
    description: "Source image.",
};

const SEED: Field = Field {
    name: "seed",
    kind: FieldKind::Number,
    required: false,
    description: "Seed for reproducible output.",
};

pub static TOOLS: &[Tool] = &[
    Tool {
        id: "flux-schnell",
        name: "FLUX.1 [schnell]",
        category: Category::Image,
        model: "fal-ai/flux/schnell",
        base_cost: 3_000,
        timeout: None,
        fields: &[
            PROMPT,
            Field {
                name: "image_size",
                kind: FieldKind::String,
                required: false,
                description: "square_hd, landscape_16_9, portrait_4_3, ...",
            },
            Field {
                name: "num_images",
                kind: FieldKind::Number,
                required: false,
                description: "1 to 4.",
            },
            SEED,
        ],
    },
    Tool {
        id: "flux-dev",
        name: "FLUX.1 [dev]",
        category: Category::Image,
        model: "fal-ai/flux/dev",
        base_cost: 25_000,
        timeout: None,
        fields: &[PROMPT, SEED],
    },
    Tool {
        id: "image-upscale",
        name: "Clarity upscaler",
        category: Category::Image,
        model: "fal-ai/clarity-upscaler",
        base_cost: 30_000,
        timeout: None,
        fields: &[
            IMAGE_URL,
            Field {
                name: "upscale_factor",
                kind: FieldKind::Number,
                required: false,
                description: "Defaults to 2.",
            },
        ],
    },
    Tool {
        id: "background-removal",
        name: "Background removal",
        category: Category::Image,
        model: "fal-ai/birefnet",
        base_cost: 5_000,
        timeout: None,
        fields: &[IMAGE_URL],
    },
    Tool {
        id: "text-to-video",
        name: "MiniMax video-01",
        category: Category::Video,
        model: "fal-ai/minimax/video-01",
        base_cost: 500_000,
        timeout: None,
        fields: &[PROMPT],
    },
    Tool {
        id: "image-to-video",
        name: "Kling 1.6 image-to-video",
        category: Category::Video,
        model: "fal-ai/kling-video/v1.6/standard/image-to-video",
        base_cost: 280_000,
        timeout: None,
        fields: &[
            PROMPT,
            IMAGE_URL,
            Field {
                name: "duration",
                kind: FieldKind::String,
                required: false,
                description: "\"5\" or \"10\" seconds.",
            },
        ],
    },
    Tool {
        id: "text-to-speech",
        name: "Kokoro TTS",
        category: Category::Audio,
        model: "fal-ai/kokoro/american-english",
        base_cost: 20_000,
        timeout: None,
        fields: &[
            PROMPT,
            Field {
                name: "voice",
                kind: FieldKind::String,
                required: false,
                description: "Voice preset.",
            },
        ],
    },
    Tool {
        id: "voice-clone",
        name: "F5 voice clone",
        category: Category::Audio,
        model: "fal-ai/f5-tts",
        base_cost: 50_000,
        timeout: None,
        fields: &[
            Field {
                name: "gen_text",
                kind: FieldKind::String,
                required: true,
                description: "Text to speak.",
            },
            Field {
                name: "ref_audio_url",
                kind: FieldKind::Url,
                required: true,
                description: "Sample of the voice to clone.",
            },
            Field {
                name: "ref_text",
                kind: FieldKind::String,
                required: false,
                description: "Transcript of the sample.",
            },
        ],
    },
    Tool {
        id: "music",
        name: "Stable Audio",
        category: Category::Audio,
        model: "fal-ai/stable-audio",
        base_cost: 40_000,
        timeout: Some(Duration::from_secs(240)),
        fields: &[
            PROMPT,
            Field {
                name: "seconds_total",
                kind: FieldKind::Number,
                required: false,
                description: "Length, up to 47 seconds.",
            },
        ],
    },
    Tool {
        id: "image-to-3d",
        name: "TRELLIS image-to-3D",
        category: Category::ThreeD,
        model: "fal-ai/trellis",
        base_cost: 20_000,
        timeout: None,
        fields: &[IMAGE_URL, SEED],
    },
];

pub static WORKFLOWS: &[Workflow] = &[
    Workflow {
        id: "animated-scene",
        description: "Generate a still, then animate it.",
        keywords: &["animate", "animation", "video", "clip", "moving"],
        steps: &[
            Step {
                tool: "flux-dev",
                from_previous: None,
            },
            Step {
                tool: "image-to-video",
                from_previous: Some("image_url"),
            },
        ],
    },
    Workflow {
        id: "product-3d",
        description: "Generate an object, cut it out, lift it into 3D.",
        keywords: &["3d", "model", "mesh", "sculpt", "object"],
        steps: &[
            Step {
                tool: "flux-schnell",
                from_previous: None,
            },
            Step {
                tool: "background-removal",
                from_previous: Some("image_url"),
            },
            Step {
                tool: "image-to-3d",
                from_previous: Some("image_url"),
            },
        ],
    },
    Workflow {
        id: "hires-image",
        description: "Generate an image and upscale it.",
        keywords: &["upscale", "high resolution", "hi-res", "4k", "print"],
        steps: &[
            Step {
                tool: "flux-dev",
                from_previous: None,
            },
            Step {
                tool: "image-upscale",
                from_previous: Some("image_url"),
            },
        ],
    },
    Workflow {
        id: "image",
        description: "Generate an image.",
        keywords: &["image", "picture", "photo", "illustration", "art"],
        steps: &[Step {
            tool: "flux-dev",
            from_previous: None,
        }],
    },
    Workflow {
        id: "narration",
        description: "Speak a script aloud.",
        keywords: &["narrate", "speech", "voiceover", "read aloud", "speak"],
        steps: &[Step {
            tool: "text-to-speech",
            from_previous: None,
        }],
    },
];

#[must_use]
pub fn tool(id: &str) -> Option<&'static Tool> {
    TOOLS.iter().find(|t| t.id == id)
}

/// Picks the template with the most keyword hits. Ties go to the one
/// declared first. Keywords match whole words only.
#[must_use]
pub fn match_goal(goal: &str) -> Option<&'static Workflow> {
    let goal = goal.to_lowercase();
    let goal = words(&goal);
    let mut best: Option<(&'static Workflow, usize)> = None;
    for workflow in WORKFLOWS {
        let hits = workflow
            .keywords
            .iter()
            .filter(|k| {
                let keyword = words(k);
                goal.windows(keyword.len()).any(|w| w == keyword.as_slice())
            })
            .count();
        if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
            best = Some((workflow, hits));
        }
    }
    best.map(|(w, _)| w)
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

impl Tool {
    /// Long-running categories get more time than the configured default.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.or_else(|| self.category.timeout()).unwrap_or(default)
    }

    #[must_use]
    pub fn credits(&self, pricing: &ConfPricing) -> i64 {
        quote(self.base_cost, pricing)
    }

    /// JSON schema of the tool's input.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in self.fields {
            let (ty, format) = match field.kind {
                FieldKind::String => ("string", None),
                FieldKind::Url => ("string", Some("uri")),
                FieldKind::Number => ("number", None),
                FieldKind::Boolean => ("boolean", None),
            };
            let mut property = json!({
                "type": ty,
                "description": field.description,
            });
            if let Some(format) = format {
                property["format"] = json!(format);
            }
            properties.insert(field.name.to_string(), property);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn validate(&self, input: &Value) -> Result<(), ValidationError> {
        let object = input.as_object().ok_or(ValidationError::NotAnObject)?;
        for field in self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(ValidationError::Missing(field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => check_kind(field, value)?,
            }
        }
        Ok(())
    }
}

impl Category {
    fn timeout(self) -> Option<Duration> {
        match self {
            Self::Image => None,
            Self::Audio => Some(Duration::from_secs(180)),
            Self::ThreeD => Some(Duration::from_secs(300)),
            Self::Video => Some(Duration::from_secs(600)),
        }
    }
}

fn check_kind(field: &Field, value: &Value) -> Result<(), ValidationError> {
    let wrong = || ValidationError::WrongKind {
        field: field.name,
        expected: field.kind,
    };
    match field.kind {
        FieldKind::String => {
            let s = value.as_str().ok_or_else(wrong)?;
            if field.required && s.trim().is_empty() {
                return Err(ValidationError::Missing(field.name));
            }
        }
        FieldKind::Url => {
            let s = value.as_str().ok_or_else(wrong)?;
            if s.trim().is_empty() {
                return Err(ValidationError::Missing(field.name));
            }
            let ok = ["https://", "http://", "data:"]
                .iter()
                .any(|scheme| s.starts_with(scheme));
            if !ok {
                return Err(ValidationError::BadUrl(field.name));
            }
        }
        FieldKind::Number => {
            value.as_f64().ok_or_else(wrong)?;
        }
        FieldKind::Boolean => {
            value.as_bool().ok_or_else(wrong)?;
        }
    }
    Ok(())
}

/// Credits for a provider cost given in micro-USD.
#[must_use]
pub fn quote(base_cost: u64, pricing: &ConfPricing) -> i64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let marked_up = (base_cost as f64 * pricing.markup).round().max(0.0) as u64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let credit_price = ((pricing.credit_price_usd * 1e6).round() as u64).max(1);
    let credits = i64::try_from(marked_up.div_ceil(credit_price))
        .unwrap_or(i64::MAX);
    credits.max(pricing.min_credits)
}

/// First media URL in a provider output, looking where the common output
/// shapes put it.
#[must_use]
pub fn media_url(output: &Value) -> Option<&str> {
    const SINGLE: [&str; 6] =
        ["image", "video", "audio", "audio_file", "model_mesh", "audio_url"];
    if let Some(url) = output
        .get("images")
        .and_then(|images| images.get(0))
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
    {
        return Some(url);
    }
    for key in SINGLE {
        match output.get(key) {
            Some(Value::String(url)) => return Some(url),
            Some(object) => {
                if let Some(url) = object.get("url").and_then(Value::as_str) {
                    return Some(url);
                }
            }
            None => {}
        }
    }
    None
}
