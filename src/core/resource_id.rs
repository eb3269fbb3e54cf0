//! KL-006: Resource id parsing (ARM and UCP forms).
//!
//! `/subscriptions/{s}/resourceGroups/{g}/providers/{ns}/{type}/{name}[/{child}/{name}]`
//! `/planes/{plane}/{name}/.../providers/{ns}/{type}/{name}`

use std::fmt;
use std::str::FromStr;

/// Parsed resource id. Comparison of types is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    raw: String,
    scopes: Vec<(String, String)>,
    namespace: Option<String>,
    types: Vec<(String, String)>,
}

impl ResourceId {
    pub fn parse(id: &str) -> Result<Self, String> {
        let rest = id
            .strip_prefix('/')
            .ok_or_else(|| format!("'{}' is not a valid resource id", id))?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(format!("'{}' is not a valid resource id", id));
        }

        let providers_at = segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case("providers"));
        let (scope_segs, type_segs) = match providers_at {
            Some(p) => (&segments[..p], &segments[p + 1..]),
            None => (&segments[..], &segments[..0]),
        };

        let mut scopes = Vec::new();
        let mut i = 0;
        if scope_segs
            .first()
            .is_some_and(|s| s.eq_ignore_ascii_case("planes"))
        {
            if scope_segs.len() < 3 {
                return Err(format!("'{}' has an incomplete plane scope", id));
            }
            scopes.push((
                scope_segs[0].to_string(),
                format!("{}/{}", scope_segs[1], scope_segs[2]),
            ));
            i = 3;
        }
        let pairs = &scope_segs[i..];
        if pairs.len() % 2 != 0 {
            return Err(format!("'{}' has an unpaired scope segment", id));
        }
        for pair in pairs.chunks(2) {
            scopes.push((pair[0].to_string(), pair[1].to_string()));
        }

        let (namespace, types) = match type_segs.split_first() {
            None if providers_at.is_some() => {
                return Err(format!("'{}' is missing a provider namespace", id))
            }
            None => (None, Vec::new()),
            Some((ns, rest)) => {
                if rest.is_empty() || rest.len() % 2 != 0 {
                    return Err(format!("'{}' has an incomplete resource type", id));
                }
                let types = rest
                    .chunks(2)
                    .map(|p| (p[0].to_string(), p[1].to_string()))
                    .collect();
                (Some(ns.to_string()), types)
            }
        };

        Ok(Self {
            raw: id.to_string(),
            scopes,
            namespace,
            types,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `Namespace/type[/childType]`, or empty for scope-only ids.
    pub fn fully_qualified_type(&self) -> String {
        match &self.namespace {
            None => String::new(),
            Some(ns) => {
                let mut out = ns.clone();
                for (t, _) in &self.types {
                    out.push('/');
                    out.push_str(t);
                }
                out
            }
        }
    }

    pub fn is_type(&self, expected: &str) -> bool {
        self.fully_qualified_type().eq_ignore_ascii_case(expected)
    }

    /// Name of the innermost resource, or of the innermost scope.
    pub fn name(&self) -> &str {
        self.types
            .last()
            .or(self.scopes.last())
            .map(|(_, n)| n.as_str())
            .unwrap_or("")
    }

    /// Value of a scope segment such as `subscriptions` or `resourceGroups`.
    pub fn scope_value(&self, key: &str) -> Option<&str> {
        self.scopes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Id of the parent resource (drops the innermost type/name pair).
    pub fn parent(&self) -> Option<ResourceId> {
        if self.types.len() < 2 {
            return None;
        }
        let (last_type, last_name) = self.types.last()?;
        let suffix = format!("/{}/{}", last_type, last_name);
        let raw = self.raw.strip_suffix(&suffix)?.to_string();
        let mut types = self.types.clone();
        types.pop();
        Some(Self {
            raw,
            scopes: self.scopes.clone(),
            namespace: self.namespace.clone(),
            types,
        })
    }

    /// Root scope of the id, e.g. `/subscriptions/{s}/resourceGroups/{g}`.
    pub fn root_scope(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.scopes {
            out.push('/');
            out.push_str(k);
            out.push('/');
            out.push_str(v);
        }
        out
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
