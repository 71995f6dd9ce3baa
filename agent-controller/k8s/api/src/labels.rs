use std::{collections::BTreeMap, sync::Arc};

/// An immutable label set, cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// Selects pods by exact label values, the way a Service selector does.
///
/// An empty selector matches every label set, mirroring the apimachinery
/// set-selector semantics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Map);

// === impl Selector ===

impl Selector {
    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|(k, v)| labels.0.get(k) == Some(v))
    }

    /// Indicates whether this selector matches all pods.
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map> for Selector {
    fn from(map: Map) -> Self {
        Self(map)
    }
}

impl From<Option<Map>> for Selector {
    fn from(map: Option<Map>) -> Self {
        Self(map.unwrap_or_default())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === impl Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Map>()
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("app", "web"))),
                Labels::from_iter(Some(("app", "web"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("app", "web"))),
                Labels::from_iter(vec![("app", "web"), ("tier", "frontend")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("app", "web"))),
                Labels::from_iter(Some(("app", "api"))),
                false,
                "value mismatch",
            ),
            (
                Selector::from_iter(vec![("app", "web"), ("tier", "frontend")]),
                Labels::from_iter(Some(("app", "web"))),
                false,
                "missing label",
            ),
            (
                Selector::default(),
                Labels::from_iter(Some(("app", "web"))),
                true,
                "empty selector matches everything",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }
}
