use std::hash::{Hash, Hasher};

use anyhow::Result;
use tantivy::schema::Schema;

pub(crate) trait Validate {
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn validate_with_schema(&self, _schema: &Schema) -> Result<()> {
        Ok(())
    }
}

pub fn cr32_hash(v: impl Hash) -> u64 {
    let mut hasher = crc32fast::Hasher::default();

    v.hash(&mut hasher);

    hasher.finish()
}

#[cfg(test)]
pub(crate) fn init_state() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
