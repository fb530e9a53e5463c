use serde::{Deserialize, Serialize};

use crate::keys::cache_key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleImageRequest {
    #[serde(alias = "marca")]
    pub make: String,
    #[serde(alias = "modelo")]
    pub model: String,
    pub year: i32,
    #[serde(default, alias = "car_color")]
    pub color: Option<String>,
    #[serde(default, alias = "car_type")]
    pub body_type: Option<String>,
    #[serde(default)]
    pub background_color_name: Option<String>,
}

impl VehicleImageRequest {
    pub fn new(make: impl Into<String>, model: impl Into<String>, year: i32) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
            year,
            color: None,
            body_type: None,
            background_color_name: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_body_type(mut self, body_type: impl Into<String>) -> Self {
        self.body_type = Some(body_type.into());
        self
    }

    pub fn with_background(mut self, background_color_name: impl Into<String>) -> Self {
        self.background_color_name = Some(background_color_name.into());
        self
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.make, &self.model, self.year)
    }

    pub fn color(&self) -> Option<&str> {
        non_blank(self.color.as_deref())
    }

    pub fn body_type(&self) -> Option<&str> {
        non_blank(self.body_type.as_deref())
    }

    pub fn background_color_name(&self) -> Option<&str> {
        non_blank(self.background_color_name.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}
