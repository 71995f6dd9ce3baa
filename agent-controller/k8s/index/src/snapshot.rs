use ahash::AHashMap as HashMap;
use std::collections::BTreeMap;

/// A single agents-ConfigMap entry, as observed or pending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub namespace: String,
    pub value: String,
}

/// The in-memory image of the last observed agents ConfigMap per namespace.
///
/// Mutated only by the ConfigMap watch (via [`Snapshot::update`]) and by the
/// update coalescer when a store opts into snapshot pre-insertion.
#[derive(Debug, Default)]
pub struct Snapshot {
    data: HashMap<String, HashMap<String, String>>,
}

impl Snapshot {
    pub fn get(&self, namespace: &str, agent_name: &str) -> Option<&str> {
        self.data
            .get(namespace)?
            .get(agent_name)
            .map(String::as_str)
    }

    /// A copy of one namespace's entries, keyed for a ConfigMap `data` field.
    pub fn namespace_data(&self, namespace: &str) -> BTreeMap<String, String> {
        self.data
            .get(namespace)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// A copy of every namespace's entries.
    pub fn all_data(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.data
            .iter()
            .map(|(ns, m)| {
                (
                    ns.clone(),
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )
            })
            .collect()
    }

    pub fn insert(&mut self, namespace: &str, agent_name: &str, value: String) {
        self.data
            .entry(namespace.to_string())
            .or_default()
            .insert(agent_name.to_string(), value);
    }

    /// Diffs `observed` against the snapshot for `namespace`, mutating the
    /// snapshot to match, and returns the removed and added-or-changed
    /// entries. `None` is an observed deletion of the whole document.
    pub fn update(
        &mut self,
        namespace: &str,
        observed: Option<&BTreeMap<String, String>>,
    ) -> (Vec<Entry>, Vec<Entry>) {
        let data = self.data.entry(namespace.to_string()).or_default();

        let mut dels = Vec::new();
        data.retain(|name, value| {
            if observed.map_or(false, |m| m.contains_key(name)) {
                return true;
            }
            dels.push(Entry {
                name: name.clone(),
                namespace: namespace.to_string(),
                value: value.clone(),
            });
            false
        });

        let mut mods = Vec::new();
        for (name, value) in observed.into_iter().flatten() {
            if data.get(name) == Some(value) {
                continue;
            }
            data.insert(name.clone(), value.clone());
            mods.push(Entry {
                name: name.clone(),
                namespace: namespace.to_string(),
                value: value.clone(),
            });
        }

        (dels, mods)
    }
}
