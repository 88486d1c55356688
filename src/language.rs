//! Request language negotiation.
//!
//! Every language type starts out as the site default. On a multilingual site
//! each type runs its configured providers in order and takes the first
//! language one of them returns.

use crate::variable::Variables;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tracing::debug;

static ACCEPT_LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z-]+|\*)(?:;\s*q=([0-9.]+))?$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Language {
    /// Language code, e.g. `en` or `pt-br`.
    pub language: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub native: String,
    /// 0 for left-to-right, 1 for right-to-left.
    #[serde(default)]
    pub direction: i64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Path prefix used by URL negotiation; empty means none.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub weight: i64,
}

fn enabled_by_default() -> bool {
    true
}

impl Language {
    pub fn english() -> Self {
        Self {
            language: "en".to_string(),
            name: "English".to_string(),
            native: "English".to_string(),
            direction: 0,
            enabled: true,
            prefix: String::new(),
            domain: String::new(),
            weight: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LanguageType {
    /// User interface text.
    Interface,
    Content,
    /// Language used to build URLs.
    Url,
}

impl LanguageType {
    pub const ALL: [LanguageType; 3] = [Self::Interface, Self::Content, Self::Url];

    pub fn name(self) -> &'static str {
        match self {
            Self::Interface => "language",
            Self::Content => "language_content",
            Self::Url => "language_url",
        }
    }

    fn default_providers(self) -> Vec<Provider> {
        match self {
            Self::Url => vec![Provider::Url, Provider::Default],
            Self::Interface | Self::Content => {
                vec![Provider::Url, Provider::Browser, Provider::Default]
            }
        }
    }
}

/// Negotiation providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// First path segment matched against language prefixes.
    Url,
    /// `Accept-Language` header.
    Browser,
    /// The site default.
    Default,
}

impl Provider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "locale-url" | "url" => Some(Self::Url),
            "locale-browser" | "browser" => Some(Self::Browser),
            "language-default" | "default" => Some(Self::Default),
            _ => None,
        }
    }
}

/// Negotiated languages for the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Languages {
    default: Language,
    multilingual: bool,
    current: HashMap<LanguageType, Language>,
}

impl Default for Languages {
    fn default() -> Self {
        Self::monolingual(Language::english())
    }
}

impl Languages {
    fn monolingual(default: Language) -> Self {
        let current = LanguageType::ALL
            .iter()
            .map(|t| (*t, default.clone()))
            .collect();
        Self {
            default,
            multilingual: false,
            current,
        }
    }

    /// Resolve languages for every type. `path` is the internal request path;
    /// URL negotiation strips a matched prefix from it.
    pub fn initialize(variables: &Variables, path: &mut String, accept_language: Option<&str>) -> Self {
        let default = variables.get_or("language_default", Language::english());
        let mut languages = Self::monolingual(default.clone());
        if variables.get_i64("language_count", 1) <= 1 {
            return languages;
        }
        languages.multilingual = true;

        let enabled: Vec<Language> = variables
            .get_or::<BTreeMap<String, Language>>("language_list", BTreeMap::new())
            .into_values()
            .filter(|l| l.enabled)
            .collect();
        let enabled = if enabled.is_empty() { vec![default.clone()] } else { enabled };

        let mut results = ProviderResults::new();
        for language_type in LanguageType::ALL {
            let providers = variables
                .get_or::<Option<Vec<String>>>(&format!("language_negotiation_{}", language_type.name()), None)
                .map(|names| names.iter().filter_map(|n| Provider::from_name(n)).collect())
                .unwrap_or_else(|| language_type.default_providers());
            let language = negotiate(
                &providers,
                &enabled,
                &default,
                path,
                accept_language,
                &mut results,
            );
            debug!(
                language_type = language_type.name(),
                language = %language.language,
                "Language negotiated"
            );
            languages.current.insert(language_type, language);
        }
        languages
    }

    pub fn default_language(&self) -> &Language {
        &self.default
    }

    pub fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    pub fn get(&self, language_type: LanguageType) -> &Language {
        self.current.get(&language_type).unwrap_or(&self.default)
    }
}

/// Provider outcomes for one request. A provider runs at most once, so the
/// URL provider strips the path prefix only once.
pub type ProviderResults = HashMap<Provider, Option<Language>>;

/// Run providers in order; fall back to the default language.
pub fn negotiate(
    providers: &[Provider],
    languages: &[Language],
    default: &Language,
    path: &mut String,
    accept_language: Option<&str>,
    results: &mut ProviderResults,
) -> Language {
    for provider in providers {
        let found = results.entry(*provider).or_insert_with(|| match provider {
            Provider::Url => {
                let (language, rest) = split_path_prefix(path, languages);
                if language.is_some() {
                    *path = rest;
                }
                language.cloned()
            }
            Provider::Browser => accept_language
                .and_then(|header| from_browser(header, languages))
                .cloned(),
            Provider::Default => Some(default.clone()),
        });
        if let Some(language) = found {
            return language.clone();
        }
    }
    default.clone()
}

/// Split a language prefix off an internal path.
pub fn split_path_prefix<'a>(path: &str, languages: &'a [Language]) -> (Option<&'a Language>, String) {
    let (first, rest) = match path.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (path, ""),
    };
    match languages
        .iter()
        .find(|l| !l.prefix.is_empty() && l.prefix == first)
    {
        Some(language) => (Some(language), rest.to_string()),
        None => (None, path.to_string()),
    }
}

/// Quality values (x1000) keyed by lowercase tag. Generic tags missing from
/// the header inherit the value of a specific tag.
pub fn parse_accept_language(header: &str) -> HashMap<String, i64> {
    let mut tags: Vec<(String, i64)> = header
        .split(',')
        .filter_map(|part| {
            let caps = ACCEPT_LANGUAGE_TAG.captures(part.trim())?;
            let tag = caps.get(1)?.as_str().to_ascii_lowercase();
            let q = caps
                .get(2)
                .and_then(|q| q.as_str().parse::<f64>().ok())
                .unwrap_or(1.0);
            Some((tag, (q * 1000.0) as i64))
        })
        .collect();

    let mut values: HashMap<String, i64> = tags.iter().cloned().collect();
    tags.sort_by_key(|(_, q)| *q);
    for (tag, q) in tags {
        if let Some((generic, _)) = tag.split_once('-') {
            values.entry(generic.to_string()).or_insert(q);
        }
    }
    values
}

/// Best enabled language for an `Accept-Language` header.
pub fn from_browser<'a>(header: &str, languages: &'a [Language]) -> Option<&'a Language> {
    let values = parse_accept_language(header);
    let wildcard = values.get("*").copied().unwrap_or(0);

    let mut best: Option<&Language> = None;
    let mut max = 0;
    for language in languages {
        let code = language.language.to_ascii_lowercase();
        let mut prefix = code.as_str();
        let q = loop {
            if let Some(q) = values.get(prefix) {
                break *q;
            }
            match prefix.rfind('-') {
                Some(idx) => prefix = &prefix[..idx],
                None => break wildcard,
            }
        };
        if q > max {
            best = Some(language);
            max = q;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lang(code: &str, prefix: &str) -> Language {
        Language {
            language: code.to_string(),
            prefix: prefix.to_string(),
            ..Language::english()
        }
    }

    #[test]
    fn test_parse_accept_language() {
        let values = parse_accept_language("fr-CA, en;q=0.5, *;q=0.1");
        assert_eq!(values["fr-ca"], 1000);
        assert_eq!(values["fr"], 1000);
        assert_eq!(values["en"], 500);
        assert_eq!(values["*"], 100);
    }

    #[test]
    fn test_from_browser_longest_prefix() {
        let languages = vec![lang("en", ""), lang("pt-br", "br"), lang("de", "de")];
        let best = from_browser("pt-BR-x-custom;q=0.8, de;q=0.3", &languages).unwrap();
        assert_eq!(best.language, "pt-br");

        let best = from_browser("ja, *;q=0.2", &languages).unwrap();
        assert_eq!(best.language, "en");
        assert!(from_browser("ja", &languages).is_none());
    }

    #[test]
    fn test_split_path_prefix() {
        let languages = vec![lang("en", ""), lang("fr", "fr")];
        let (found, rest) = split_path_prefix("fr/node/1", &languages);
        assert_eq!(found.unwrap().language, "fr");
        assert_eq!(rest, "node/1");

        let (found, rest) = split_path_prefix("node/1", &languages);
        assert!(found.is_none());
        assert_eq!(rest, "node/1");
    }

    #[test]
    fn test_monolingual_site_uses_default() {
        let vars = Variables::default();
        let mut path = "fr/node".to_string();
        let languages = Languages::initialize(&vars, &mut path, Some("fr"));
        assert!(!languages.is_multilingual());
        assert_eq!(languages.get(LanguageType::Content).language, "en");
        assert_eq!(path, "fr/node");
    }

    #[test]
    fn test_multilingual_negotiation() {
        let mut vars = Variables::default();
        vars.set_override("language_count", json!(2));
        vars.set_override(
            "language_list",
            json!({
                "en": {"language": "en", "prefix": ""},
                "fr": {"language": "fr", "prefix": "fr"},
                "de": {"language": "de", "prefix": "de", "enabled": false},
            }),
        );
        vars.set_override("language_negotiation_language_content", json!(["locale-browser"]));

        let mut path = "fr/node/1".to_string();
        let languages = Languages::initialize(&vars, &mut path, Some("de, en;q=0.4"));
        assert_eq!(languages.get(LanguageType::Interface).language, "fr");
        assert_eq!(languages.get(LanguageType::Url).language, "fr");
        // The disabled language is never picked.
        assert_eq!(languages.get(LanguageType::Content).language, "en");
        assert_eq!(path, "node/1");
    }
}
