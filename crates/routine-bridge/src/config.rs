//! Configuration document loading and parameter resolution.

#![allow(missing_docs)]

use std::path::MAIN_SEPARATOR;
use std::sync::Mutex;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::warn;

use crate::error::BridgeError;

/// One node of the loaded configuration tree.
///
/// Owned and immutable after load; the XML parser is only used while
/// building this tree.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    pub name: SmolStr,
    pub attributes: IndexMap<SmolStr, String>,
    pub text: String,
    pub children: Vec<ConfigNode>,
}

/// Immutable, loaded-once configuration document.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: ConfigNode,
}

impl ConfigDocument {
    /// Load a document from a file path. Environment macros in the path
    /// itself are expanded first. Malformed or unreadable input fails fast.
    pub fn load(path: &str) -> Result<Self, BridgeError> {
        let expanded = expand_env(path);
        let text = std::fs::read_to_string(&expanded).map_err(|err| BridgeError::ConfigLoad {
            path: expanded.as_str().into(),
            detail: err.to_string().into(),
        })?;
        Self::from_str_named(&text, &expanded)
    }

    /// Parse a document from already-loaded text.
    pub fn from_str(text: &str) -> Result<Self, BridgeError> {
        Self::from_str_named(text, "<inline>")
    }

    fn from_str_named(text: &str, path: &str) -> Result<Self, BridgeError> {
        let doc = roxmltree::Document::parse(text).map_err(|err| BridgeError::ConfigLoad {
            path: path.into(),
            detail: err.to_string().into(),
        })?;
        Ok(Self {
            root: build_node(doc.root_element()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &ConfigNode {
        &self.root
    }

    /// Answer a path-style query, `None` if no node matches.
    ///
    /// Query shape: `/root/section[@name='x']/leaf/@attr` — element steps with
    /// an optional single-attribute predicate, final step optionally an
    /// attribute. The first matching node wins.
    #[must_use]
    pub fn query(&self, path: &str) -> Option<String> {
        let (steps, attr) = parse_query(path)?;
        let mut first = steps.iter();
        let root_step = first.next()?;
        if !root_step.matches(&self.root) {
            return None;
        }
        let node = first.try_fold(&self.root, |node, step| {
            node.children.iter().find(|child| step.matches(child))
        })?;
        match attr {
            Some(name) => node.attributes.get(name.as_str()).cloned(),
            None => Some(node.text.clone()),
        }
    }

    /// All element nodes matching a query with no trailing attribute step.
    #[must_use]
    pub fn query_all(&self, path: &str) -> Vec<&ConfigNode> {
        let Some((steps, None)) = parse_query(path) else {
            return Vec::new();
        };
        let mut current: Vec<&ConfigNode> = Vec::new();
        let mut iter = steps.iter();
        match iter.next() {
            Some(step) if step.matches(&self.root) => current.push(&self.root),
            _ => return Vec::new(),
        }
        for step in iter {
            current = current
                .iter()
                .flat_map(|node| node.children.iter().filter(|child| step.matches(child)))
                .collect();
        }
        current
    }
}

fn build_node(node: roxmltree::Node<'_, '_>) -> ConfigNode {
    let attributes = node
        .attributes()
        .map(|attr| (SmolStr::new(attr.name()), attr.value().to_string()))
        .collect();
    let children = node
        .children()
        .filter(roxmltree::Node::is_element)
        .map(build_node)
        .collect();
    ConfigNode {
        name: SmolStr::new(node.tag_name().name()),
        attributes,
        text: node.text().unwrap_or("").trim().to_string(),
        children,
    }
}

#[derive(Debug)]
struct QueryStep {
    name: SmolStr,
    predicate: Option<(SmolStr, String)>,
}

impl QueryStep {
    fn matches(&self, node: &ConfigNode) -> bool {
        if node.name != self.name {
            return false;
        }
        match &self.predicate {
            Some((attr, value)) => node.attributes.get(attr.as_str()) == Some(value),
            None => true,
        }
    }
}

fn parse_query(path: &str) -> Option<(Vec<QueryStep>, Option<SmolStr>)> {
    let mut steps = Vec::new();
    let mut attr = None;
    let segments: Vec<&str> = path.strip_prefix('/')?.split('/').collect();
    for (index, segment) in segments.iter().enumerate() {
        if let Some(name) = segment.strip_prefix('@') {
            // An attribute step is only valid as the final segment.
            if index + 1 != segments.len() || name.is_empty() {
                return None;
            }
            attr = Some(SmolStr::new(name));
            continue;
        }
        steps.push(parse_step(segment)?);
    }
    if steps.is_empty() {
        return None;
    }
    Some((steps, attr))
}

fn parse_step(segment: &str) -> Option<QueryStep> {
    let Some(open) = segment.find('[') else {
        if segment.is_empty() {
            return None;
        }
        return Some(QueryStep {
            name: SmolStr::new(segment),
            predicate: None,
        });
    };
    let name = &segment[..open];
    let inner = segment[open..].strip_prefix("[@")?.strip_suffix(']')?;
    let (attr, raw) = inner.split_once('=')?;
    let value = raw
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap_or(raw);
    if name.is_empty() || attr.is_empty() {
        return None;
    }
    Some(QueryStep {
        name: SmolStr::new(name),
        predicate: Some((SmolStr::new(attr), value.to_string())),
    })
}

/// Expand `$(NAME)` and `${NAME}` environment macros in a textual value.
///
/// Unknown macros are left in place so a missing variable shows up verbatim
/// in the resulting path instead of aborting resolution.
#[must_use]
pub fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let close = match tail.as_bytes().get(1) {
            Some(b'(') => tail.find(')').map(|end| (2, end, ")")),
            Some(b'{') => tail.find('}').map(|end| (2, end, "}")),
            _ => None,
        };
        match close {
            Some((open, end, _)) => {
                let name = &tail[open..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push('$');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parameter type vocabulary used by configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Float64,
    Int32,
    String,
    Float64Array,
    Int32Array,
}

impl ParamType {
    /// Parse a type tag; enumerated/boolean tags share int32 storage.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "float64" => Some(Self::Float64),
            "int32" | "enum" | "ring" | "boolean" => Some(Self::Int32),
            "string" => Some(Self::String),
            "float64array" => Some(Self::Float64Array),
            "int32array" => Some(Self::Int32Array),
            _ => None,
        }
    }
}

/// Configuration-driven parameter resolver with memoized queries.
///
/// Owns the document for its lifetime. Both memo tables are append-only and
/// guarded by a lock scoped to this resolver; once a path is memoized the
/// same answer is returned for the document's lifetime.
#[derive(Debug)]
pub struct Resolver {
    doc: ConfigDocument,
    memo_str: Mutex<FxHashMap<SmolStr, String>>,
    memo_bool: Mutex<FxHashMap<SmolStr, bool>>,
}

impl Resolver {
    #[must_use]
    pub fn new(doc: ConfigDocument) -> Self {
        Self {
            doc,
            memo_str: Mutex::new(FxHashMap::default()),
            memo_bool: Mutex::new(FxHashMap::default()),
        }
    }

    /// Load a document from a file path and wrap it in a resolver.
    pub fn load(path: &str) -> Result<Self, BridgeError> {
        ConfigDocument::load(path).map(Self::new)
    }

    #[must_use]
    pub fn document(&self) -> &ConfigDocument {
        &self.doc
    }

    /// Resolve a query to a string; `""` when the path has no node.
    pub fn resolve_string(&self, path: &str) -> String {
        let mut memo = self.memo_str.lock().expect("resolver memo poisoned");
        if let Some(hit) = memo.get(path) {
            return hit.clone();
        }
        let answer = self.doc.query(path).unwrap_or_default();
        memo.insert(SmolStr::new(path), answer.clone());
        answer
    }

    /// Resolve a query as a boolean.
    ///
    /// Empty or missing is false; a leading `t`/`T`/`y`/`Y` is true;
    /// otherwise a non-zero numeric parse is true.
    pub fn resolve_bool(&self, path: &str) -> bool {
        let mut memo = self.memo_bool.lock().expect("resolver memo poisoned");
        if let Some(hit) = memo.get(path) {
            return *hit;
        }
        let text = self.doc.query(path).unwrap_or_default();
        let answer = interpret_bool(&text);
        memo.insert(SmolStr::new(path), answer);
        answer
    }

    /// Resolve a query to a host-native filesystem path.
    ///
    /// The document is authored separator-neutral with `/`; macros are
    /// expanded and separators converted to the host convention.
    pub fn resolve_native_path(&self, path: &str) -> String {
        let raw = self.resolve_string(path);
        expand_env(&raw).replace('/', &MAIN_SEPARATOR.to_string())
    }

    /// Enumerate the parameters of a named section, in document order.
    ///
    /// Entries with an unknown type tag are skipped with a warning.
    pub fn params(&self, section: &str) -> IndexMap<SmolStr, ParamType> {
        let query = format!("/bridge/section[@name='{section}']/routine/param");
        let mut out = IndexMap::new();
        for node in self.doc.query_all(&query) {
            let Some(name) = node.attributes.get("name") else {
                continue;
            };
            let tag = node.attributes.get("type").map_or("", String::as_str);
            match ParamType::parse(tag) {
                Some(ty) => {
                    out.insert(SmolStr::new(name), ty);
                }
                None => warn!(param = %name, r#type = %tag, "unknown parameter type, skipped"),
            }
        }
        out
    }
}

fn interpret_bool(text: &str) -> bool {
    match text.chars().next() {
        None => false,
        Some('t' | 'T' | 'y' | 'Y') => true,
        _ => text.trim().parse::<f64>().is_ok_and(|value| value != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
<bridge>
  <extint path="/routines/extint"/>
  <section name="motor">
    <routine path="/routines/motor/frontpanel">
      <param name="setpoint" type="float64">
        <read target="Setpoint"/>
        <set target="Setpoint" extint="true" post="commit" wait="true"/>
      </param>
      <param name="status" type="string">
        <read target="Status"/>
      </param>
      <param name="mystery" type="quaternion">
        <read target="Q"/>
      </param>
    </routine>
  </section>
</bridge>
"#;

    fn resolver() -> Resolver {
        Resolver::new(ConfigDocument::from_str(DOC).unwrap())
    }

    #[test]
    fn malformed_document_fails_fast() {
        let err = ConfigDocument::from_str("<bridge><oops></bridge>").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigLoad { .. }));
    }

    #[test]
    fn attribute_and_predicate_queries() {
        let r = resolver();
        assert_eq!(r.resolve_string("/bridge/extint/@path"), "/routines/extint");
        assert_eq!(
            r.resolve_string(
                "/bridge/section[@name='motor']/routine/param[@name='setpoint']/read/@target"
            ),
            "Setpoint"
        );
        // Missing nodes resolve softly to "".
        assert_eq!(
            r.resolve_string("/bridge/section[@name='absent']/routine/@path"),
            ""
        );
    }

    #[test]
    fn bool_interpretation() {
        let r = resolver();
        assert!(r.resolve_bool(
            "/bridge/section[@name='motor']/routine/param[@name='setpoint']/set/@extint"
        ));
        // Missing path is false.
        assert!(!r.resolve_bool(
            "/bridge/section[@name='motor']/routine/param[@name='status']/set/@extint"
        ));
        assert!(!interpret_bool(""));
        assert!(!interpret_bool("0"));
        assert!(interpret_bool("true"));
        assert!(interpret_bool("Yes"));
        assert!(interpret_bool("2"));
        assert!(!interpret_bool("false"));
    }

    #[test]
    fn repeated_queries_return_memoized_answer() {
        let r = resolver();
        let first = r.resolve_string("/bridge/extint/@path");
        assert_eq!(r.resolve_string("/bridge/extint/@path"), first);
        let miss = r.resolve_string("/bridge/nothing/@here");
        assert_eq!(miss, "");
        assert_eq!(r.resolve_string("/bridge/nothing/@here"), "");
    }

    #[test]
    fn native_path_expands_macros() {
        std::env::set_var("RB_TEST_ROOT", "/opt/rigs");
        let doc = ConfigDocument::from_str(
            r#"<bridge><section name="s"><routine path="$(RB_TEST_ROOT)/panel"/></section></bridge>"#,
        )
        .unwrap();
        let r = Resolver::new(doc);
        let native = r.resolve_native_path("/bridge/section[@name='s']/routine/@path");
        let sep = MAIN_SEPARATOR.to_string();
        assert_eq!(native, format!("{sep}opt{sep}rigs{sep}panel"));
    }

    #[test]
    fn unknown_macro_left_in_place() {
        assert_eq!(
            expand_env("$(RB_TEST_NO_SUCH_VAR)/x"),
            "$(RB_TEST_NO_SUCH_VAR)/x"
        );
        assert_eq!(expand_env("no macros"), "no macros");
        assert_eq!(expand_env("trailing $"), "trailing $");
    }

    #[test]
    fn section_param_listing_skips_unknown_types() {
        let r = resolver();
        let params = r.params("motor");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("setpoint"), Some(&ParamType::Float64));
        assert_eq!(params.get("status"), Some(&ParamType::String));
        assert!(params.get("mystery").is_none());
    }

    #[test]
    fn enumerated_tags_share_int32_storage() {
        assert_eq!(ParamType::parse("enum"), Some(ParamType::Int32));
        assert_eq!(ParamType::parse("ring"), Some(ParamType::Int32));
        assert_eq!(ParamType::parse("boolean"), Some(ParamType::Int32));
        assert_eq!(ParamType::parse("bogus"), None);
    }
}
