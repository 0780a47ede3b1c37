//! The project configuration: which families, subfamilies and styles exist,
//! what each of them looks like, and which subset is being built.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

fn default_prefix() -> String {
    String::from("Sarasa")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Prefix of every produced file name.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub family_order: Vec<String>,
    pub subfamily_order: Vec<String>,
    pub style_order: Vec<String>,
    pub families: IndexMap<String, Family>,
    pub styles: IndexMap<String, Style>,
    #[serde(default)]
    pub latin_groups: IndexMap<String, LatinGroup>,
    pub shs_source_map: ShsSourceMap,
    #[serde(default)]
    pub build_options: BuildOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    pub latin_group: String,
    #[serde(default)]
    pub is_gothic: bool,
    #[serde(default)]
    pub is_mono: bool,
    #[serde(default, rename = "isPWID")]
    pub is_pwid: bool,
    #[serde(default, rename = "isTNUM")]
    pub is_tnum: bool,
    #[serde(default)]
    pub is_term: bool,
}

/// Family flags in the shape the glyph scripts expect them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flags {
    pub goth: bool,
    pub mono: bool,
    pub pwid: bool,
    pub tnum: bool,
    pub term: bool,
}

impl From<&Family> for Flags {
    fn from(family: &Family) -> Self {
        Self {
            goth: family.is_gothic,
            mono: family.is_mono,
            pwid: family.is_pwid,
            tnum: family.is_tnum,
            term: family.is_term,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    /// Set for slanted styles, which reuse the glyphs of their upright base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upright_style_map: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatinGroup {
    /// Sources are CFF outlines and must be converted rather than autohinted.
    #[serde(default)]
    pub is_cff: bool,
}

/// Where the CJK source fonts come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShsSourceMap {
    pub default_region: String,
    /// Subfamily to source file prefix.
    pub region: IndexMap<String, String>,
    /// Style to source file suffix, when they differ.
    #[serde(default)]
    pub style_map: IndexMap<String, String>,
    #[serde(default)]
    pub classical_region: Option<String>,
    #[serde(default)]
    pub classical_override_prefix: Option<String>,
    #[serde(default)]
    pub classical_override_suffix_map: IndexMap<String, String>,
}

impl ShsSourceMap {
    /// File suffix of the sources for a weight.
    pub fn suffix<'a>(&'a self, weight: &'a str) -> &'a str {
        self.style_map.get(weight).map(String::as_str).unwrap_or(weight)
    }

    /// Whether a subfamily gets its classical glyphs from the override font.
    pub fn has_classical_override(&self, region: &str) -> bool {
        self.classical_override_prefix.is_some() && self.classical_region.as_deref() == Some(region)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfamilies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hinted_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

impl Config {
    /// Reads `config.json` from the project root, merging the `buildOptions`
    /// of `config.private.json` over it when that file exists.
    pub fn load(root: &Utf8Path) -> Result<Self, ConfigError> {
        let path = root.join("config.json");
        let mut value = read_json(&path)?;

        let private = root.join("config.private.json");
        if private.exists() {
            tracing::debug!("Applying private configuration {private}");
            merge_build_options(&mut value, read_json(&private)?);
        }

        let config: Config =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Every name listed in an order must be described, every alias style
    /// must point at a real upright style and every subfamily needs a source.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for family in &self.family_order {
            if !self.families.contains_key(family) {
                return Err(ConfigError::UnknownFamily(family.clone()));
            }
        }

        for style in &self.style_order {
            if !self.styles.contains_key(style) {
                return Err(ConfigError::UnknownStyle(style.clone()));
            }
        }

        for (style, attrs) in &self.styles {
            if let Some(upright) = &attrs.upright_style_map {
                match self.styles.get(upright) {
                    Some(base) if base.upright_style_map.is_none() => {}
                    _ => return Err(ConfigError::UnknownUpright(style.clone(), upright.clone())),
                }
            }
        }

        for subfamily in &self.subfamily_order {
            if !self.shs_source_map.region.contains_key(subfamily) {
                return Err(ConfigError::UnknownSubfamily(subfamily.clone()));
            }
        }

        Ok(())
    }

    pub fn is_alias(&self, style: &str) -> bool {
        self.styles
            .get(style)
            .is_some_and(|s| s.upright_style_map.is_some())
    }

    /// The upright counterpart of a style name. Compound names are mapped part
    /// by part, so `Gothic-SC-BoldItalic` becomes `Gothic-SC-Bold`.
    pub fn deitalized(&self, name: &str) -> String {
        name.split('-')
            .map(|part| {
                self.styles
                    .get(part)
                    .and_then(|s| s.upright_style_map.as_deref())
                    .unwrap_or(part)
            })
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn is_italic(&self, style: &str) -> bool {
        self.deitalized(style) != style
    }

    /// Upright weights in hinting order. Only weights some active style is
    /// based on take part.
    pub fn hint_weights(&self) -> Vec<String> {
        self.styles
            .iter()
            .filter(|(_, attrs)| attrs.upright_style_map.is_none())
            .map(|(name, _)| name)
            .filter(|weight| {
                self.style_order
                    .iter()
                    .any(|style| &self.deitalized(style) == *weight)
            })
            .cloned()
            .collect()
    }

    /// Active styles whose upright base is `weight`.
    pub fn styles_of_weight<'a>(&'a self, weight: &'a str) -> impl Iterator<Item = &'a String> {
        self.style_order
            .iter()
            .filter(move |style| self.deitalized(style) == weight)
    }

    pub fn family(&self, name: &str) -> Option<&Family> {
        self.families.get(name)
    }

    pub fn latin_group(&self, name: &str) -> LatinGroup {
        self.latin_groups.get(name).cloned().unwrap_or_default()
    }

    pub fn hinted_only(&self) -> bool {
        self.build_options.hinted_only.unwrap_or(false)
    }

    /// The configuration as the build steps see it: build options only
    /// select what gets built, they never change how a single font is made.
    pub fn observed(&self) -> Self {
        Self {
            build_options: BuildOptions::default(),
            ..self.clone()
        }
    }
}

fn read_json(path: &Utf8Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
}

fn merge_build_options(base: &mut Value, overlay: Value) {
    let Some(Value::Object(extra)) = overlay.get("buildOptions").cloned() else {
        return;
    };

    let Value::Object(root) = base else {
        return;
    };

    let options = root
        .entry("buildOptions")
        .or_insert_with(|| Value::Object(Default::default()));

    if !options.is_object() {
        *options = Value::Object(Default::default());
    }

    if let Value::Object(options) = options {
        options.extend(extra);
    }
}

/// Selection of the matrix to build, after environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub families: Option<Vec<String>>,
    pub subfamilies: Option<Vec<String>>,
    pub styles: Option<Vec<String>>,
    pub hinted_only: bool,
}

impl Filter {
    /// `buildOptions` overridden by `FONT_FAMILIES`, `FONT_SUBFAMILIES`,
    /// `FONT_STYLES` and `FONT_HINTED_ONLY`.
    pub fn from_env(options: &BuildOptions) -> Self {
        Self::with_vars(options, |name| std::env::var(name).ok())
    }

    pub fn with_vars(options: &BuildOptions, var: impl Fn(&str) -> Option<String>) -> Self {
        let list = |name: &str, fallback: &Option<Vec<String>>| match var(name) {
            Some(value) if !value.trim().is_empty() => Some(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            _ => fallback.clone(),
        };

        let hinted_only = match var("FONT_HINTED_ONLY").as_deref().map(str::trim) {
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            _ => options.hinted_only.unwrap_or(false),
        };

        Self {
            families: list("FONT_FAMILIES", &options.families),
            subfamilies: list("FONT_SUBFAMILIES", &options.subfamilies),
            styles: list("FONT_STYLES", &options.styles),
            hinted_only,
        }
    }

    /// Narrows the axes of `config`, keeping the configured order. Names the
    /// configuration does not know are reported and skipped; an axis left
    /// empty is an error.
    pub fn apply(&self, config: &Config) -> Result<Config, ConfigError> {
        let mut active = config.clone();

        active.family_order = select("family", &config.family_order, &self.families)?;
        active.subfamily_order = select("subfamily", &config.subfamily_order, &self.subfamilies)?;
        active.style_order = select("style", &config.style_order, &self.styles)?;
        active.build_options.hinted_only = Some(self.hinted_only);

        Ok(active)
    }
}

fn select(
    axis: &'static str,
    order: &[String],
    filter: &Option<Vec<String>>,
) -> Result<Vec<String>, ConfigError> {
    let selected: Vec<String> = match filter {
        None => order.to_vec(),
        Some(wanted) => {
            for name in wanted {
                if !order.contains(name) {
                    tracing::warn!("Ignoring unknown {axis} '{name}' in the build filter");
                }
            }

            order
                .iter()
                .filter(|name| wanted.contains(name))
                .cloned()
                .collect()
        }
    };

    if selected.is_empty() {
        return Err(ConfigError::EmptyAxis {
            axis,
            filter: filter.as_deref().unwrap_or_default().join(","),
        });
    }

    Ok(selected)
}

/// The project version, from `package.json`.
pub fn read_version(root: &Utf8Path) -> Result<String, ConfigError> {
    let path: Utf8PathBuf = root.join("package.json");
    read_json(&path)?
        .get("version")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(ConfigError::Version(path))
}
