//! Keyword router over declarative route rules. Every routing pass also
//! yields a resilience fallback candidate so a run never starts empty.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{McpError, McpErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRule {
    pub name: String,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub default_params: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct RoutesFile {
    #[serde(default)]
    rules: Vec<RouteRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteMatch {
    pub rule: String,
    pub server: String,
    pub tool: String,
    pub confidence: f64,
    pub hits: Vec<String>,
    pub default_params: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RouteRule>,
}

impl Router {
    /// Load route rules; a missing file yields the builtin rules.
    ///
    /// # Errors
    /// Returns a `CONFIG` error for unreadable or invalid files.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let raw = fs::read_to_string(path).map_err(|err| {
            McpError::new(
                McpErrorCode::Config,
                format!("cannot read {}: {err}", path.display()),
            )
        })?;
        let file: RoutesFile = serde_json::from_str(&raw).map_err(|err| {
            McpError::new(
                McpErrorCode::Config,
                format!("invalid routes file {}: {err}", path.display()),
            )
        })?;
        Ok(Self { rules: file.rules })
    }

    #[must_use]
    pub fn builtin() -> Self {
        Self {
            rules: vec![
                RouteRule {
                    name: "fetch_url".to_string(),
                    server: "fetch".to_string(),
                    tool: "get".to_string(),
                    keywords: vec![
                        "http://".to_string(),
                        "https://".to_string(),
                        "抓取".to_string(),
                        "fetch".to_string(),
                        "下载".to_string(),
                    ],
                    default_params: Map::new(),
                },
                RouteRule {
                    name: "local_files".to_string(),
                    server: "filesystem".to_string(),
                    tool: "list_dir".to_string(),
                    keywords: vec![
                        "文件".to_string(),
                        "目录".to_string(),
                        "file".to_string(),
                        "directory".to_string(),
                    ],
                    default_params: Map::new(),
                },
                RouteRule {
                    name: "sql_query".to_string(),
                    server: "sqlite".to_string(),
                    tool: "query".to_string(),
                    keywords: vec![
                        "sql".to_string(),
                        "select".to_string(),
                        "查询".to_string(),
                    ],
                    default_params: Map::new(),
                },
            ],
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Best single route for the text, or the reasoning fallback.
    #[must_use]
    pub fn route(&self, text: &str) -> RouteMatch {
        let mut best: Option<RouteMatch> = None;
        for candidate in self.candidates(text) {
            match &best {
                Some(current) if current.confidence >= candidate.confidence => {}
                _ => best = Some(candidate),
            }
        }
        best.unwrap_or_else(|| fallback_route(text))
    }

    /// Every rule with at least one keyword hit, plus the fallback.
    #[must_use]
    pub fn candidates(&self, text: &str) -> Vec<RouteMatch> {
        let low = text.to_lowercase();
        let mut out = Vec::new();
        for rule in &self.rules {
            let hits: Vec<String> = rule
                .keywords
                .iter()
                .filter(|keyword| low.contains(keyword.to_lowercase().as_str()))
                .cloned()
                .collect();
            if hits.is_empty() {
                continue;
            }
            let denominator = (rule.keywords.len() as f64 * 0.5).max(1.0);
            let confidence = (hits.len() as f64 / denominator).min(1.0);
            out.push(RouteMatch {
                rule: rule.name.clone(),
                server: rule.server.clone(),
                tool: rule.tool.clone(),
                confidence: (confidence * 1000.0).round() / 1000.0,
                hits,
                default_params: rule.default_params.clone(),
            });
        }
        let fallback = fallback_route(text);
        if !out
            .iter()
            .any(|m| m.server == fallback.server && m.tool == fallback.tool)
        {
            out.push(fallback);
        }
        out
    }
}

fn fallback_route(text: &str) -> RouteMatch {
    let mut params = Map::new();
    params.insert(
        "problem".to_string(),
        json!(if text.trim().is_empty() {
            "Break the task into steps".to_string()
        } else {
            text.to_string()
        }),
    );
    RouteMatch {
        rule: "fallback_resilience".to_string(),
        server: "sequential-thinking".to_string(),
        tool: "think".to_string(),
        confidence: 0.08,
        hits: Vec::new(),
        default_params: params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_text_routes_to_fetch() {
        let router = Router::builtin();
        let matched = router.route("抓取 https://example.com 并摘要");
        assert_eq!(matched.server, "fetch");
        assert_eq!(matched.tool, "get");
        assert!(matched.confidence > 0.1);
    }

    #[test]
    fn unmatched_text_falls_back_to_thinking() {
        let router = Router::builtin();
        let matched = router.route("帮我想一想下一步");
        assert_eq!(matched.server, "sequential-thinking");
        assert!(matched.default_params.contains_key("problem"));
    }

    #[test]
    fn candidates_always_include_the_fallback() {
        let router = Router::builtin();
        let candidates = router.candidates("抓取 https://example.com");
        assert!(candidates
            .iter()
            .any(|c| c.server == "sequential-thinking" && c.tool == "think"));
        assert!(candidates.iter().any(|c| c.server == "fetch"));
    }
}
