use serde::{de::DeserializeOwned, Serialize};

/// A contiguous run of present values. Value lists store runs as plain
/// vectors; text stores them as strings so a long typing burst costs one
/// allocation, not one per character.
pub trait RunBuffer: Clone + Default + Serialize + DeserializeOwned + 'static {
    type Value: Clone + 'static;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn push(&mut self, v: Self::Value);
    fn get(&self, i: usize) -> Option<Self::Value>;
    /// Split into [0, at) (kept) and [at, len) (returned).
    fn split_off(&mut self, at: usize) -> Self;
    fn extend_from(&mut self, other: Self);
    fn values(&self) -> Vec<Self::Value>;

    fn from_values(vals: Vec<Self::Value>) -> Self {
        let mut run = Self::default();
        for v in vals {
            run.push(v);
        }
        run
    }
}

impl<T: Clone + Serialize + DeserializeOwned + 'static> RunBuffer for Vec<T> {
    type Value = T;

    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn push(&mut self, v: T) {
        Vec::push(self, v)
    }
    fn get(&self, i: usize) -> Option<T> {
        self.as_slice().get(i).cloned()
    }
    fn split_off(&mut self, at: usize) -> Self {
        Vec::split_off(self, at)
    }
    fn extend_from(&mut self, other: Self) {
        self.extend(other)
    }
    fn values(&self) -> Vec<T> {
        self.clone()
    }
}

/// String-backed run of chars.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CharRuns(pub String);

impl CharRuns {
    fn byte_of_char(&self, i: usize) -> usize {
        self.0
            .char_indices()
            .nth(i)
            .map(|(b, _)| b)
            .unwrap_or(self.0.len())
    }
}

impl RunBuffer for CharRuns {
    type Value = char;

    fn len(&self) -> usize {
        self.0.chars().count()
    }
    fn push(&mut self, v: char) {
        self.0.push(v)
    }
    fn get(&self, i: usize) -> Option<char> {
        self.0.chars().nth(i)
    }
    fn split_off(&mut self, at: usize) -> Self {
        let b = self.byte_of_char(at);
        CharRuns(self.0.split_off(b))
    }
    fn extend_from(&mut self, other: Self) {
        self.0.push_str(&other.0)
    }
    fn values(&self) -> Vec<char> {
        self.0.chars().collect()
    }
}

impl From<&str> for CharRuns {
    fn from(s: &str) -> Self {
        CharRuns(s.to_string())
    }
}
