/// Deserializes strings straight into `Arc<str>`, which is how names are shared between the
/// topology, the matrix and the rule tables
pub mod serde_arc_str {
    use serde::{Deserialize, Deserializer};
    use std::sync::Arc;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_boxed_str().into())
    }

    /// Like [`deserialize`], but for fields that may be absent or `null`
    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Arc<str>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.filter(|s| !s.is_empty()).map(|s| s.into_boxed_str().into()))
    }
}
