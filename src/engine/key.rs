use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;

/// How a node decides whether its previous result can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    /// Produces exactly one file at a declared target path. Up to date when
    /// the inputs are unchanged and the file on disk still matches.
    File,
    /// Produces nothing persistent, always considered changed.
    Phony,
    /// Observes the outside world. Re-evaluated every run, but dependents
    /// only re-run when the observed value actually changes.
    Oracle,
    /// Pure function of its inputs, cached by input signature.
    Computed,
    /// Orchestration step grouping other nodes, cached by input signature.
    Task,
}

impl TaskKind {
    /// Whether nodes of this kind are looked up in the journal by default.
    pub const fn cached_by_default(self) -> bool {
        matches!(self, TaskKind::File | TaskKind::Computed | TaskKind::Task)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            TaskKind::File => "file",
            TaskKind::Phony => "phony",
            TaskKind::Oracle => "oracle",
            TaskKind::Computed => "computed",
            TaskKind::Task => "task",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered parameter tuple of a rule instance, e.g. `["Gothic", "SC", "Bold"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<ArcStr>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: impl AsRef<str>) -> Self {
        self.0.push(ArcStr::from(value.as_ref()));
        self
    }

    pub fn push(&mut self, value: impl AsRef<str>) {
        self.0.push(ArcStr::from(value.as_ref()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| &**s)
    }

    /// Injective text form: a JSON array of strings. Separators or quotes
    /// inside values are escaped, so distinct tuples never share a form.
    pub fn canonical(&self) -> String {
        let items: Vec<&str> = self.iter().collect();
        // Serializing a slice of &str cannot fail.
        serde_json::to_string(&items).unwrap_or_default()
    }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for Params {
    fn from(values: [S; N]) -> Self {
        values.iter().fold(Params::new(), |acc, v| acc.with(v))
    }
}

impl<S: AsRef<str>> FromIterator<S> for Params {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().fold(Params::new(), |acc, v| acc.with(v))
    }
}

/// Builds a [`Params`] tuple from anything string-like.
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::Params::new()$(.with($value))+
    };
}

/// Stable identity of a node: kind, rule name and canonical parameters.
///
/// The canonical string is what the journal is keyed on, so it must not
/// depend on anything that varies between runs (paths, ordering of maps).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    kind: TaskKind,
    name: &'static str,
    params: Params,
    canonical: ArcStr,
}

impl Key {
    pub fn new(kind: TaskKind, name: &'static str, params: Params) -> Self {
        let canonical = format!("{}:{}:{}", kind.as_str(), name, params.canonical());
        Self {
            kind,
            name,
            params,
            canonical: canonical.into(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Human friendly label, e.g. `kanji0(SC, Regular)`.
    pub fn label(&self) -> String {
        if self.params.is_empty() {
            self.name.to_string()
        } else {
            let params: Vec<&str> = self.params.iter().collect();
            format!("{}({})", self.name, params.join(", "))
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_tuples_give_equal_keys() {
        let a = Key::new(TaskKind::File, "kanji0", params!["SC", "Regular"]);
        let b = Key::new(TaskKind::File, "kanji0", Params::from(["SC", "Regular"]));
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_form_is_injective_over_separators() {
        let joined = Key::new(TaskKind::Task, "t", params!["a:b"]);
        let split = Key::new(TaskKind::Task, "t", params!["a", "b"]);
        let quoted = Key::new(TaskKind::Task, "t", params!["a\",\"b"]);
        assert_ne!(joined.canonical(), split.canonical());
        assert_ne!(quoted.canonical(), split.canonical());
    }

    #[test]
    fn test_kind_and_name_are_part_of_identity() {
        let file = Key::new(TaskKind::File, "x", params!["1"]);
        let task = Key::new(TaskKind::Task, "x", params!["1"]);
        let other = Key::new(TaskKind::File, "y", params!["1"]);
        assert_ne!(file, task);
        assert_ne!(file, other);
    }

    #[test]
    fn test_label_lists_params() {
        let key = Key::new(TaskKind::File, "pass1", params!["Gothic", "SC", "Bold"]);
        assert_eq!(key.label(), "pass1(Gothic, SC, Bold)");
        assert_eq!(Key::new(TaskKind::Phony, "all", Params::new()).label(), "all");
    }
}
