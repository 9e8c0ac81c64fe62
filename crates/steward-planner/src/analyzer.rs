use async_trait::async_trait;
use steward_core::Finding;

/// Source of findings for a repository.
///
/// Implementations may be slow or fail; a failure aborts plan building for
/// the run instead of producing a partial plan.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, repository: &str) -> anyhow::Result<Vec<Finding>>;
}

/// Analyzer returning a fixed list of findings.
pub struct StaticAnalyzer {
    findings: Vec<Finding>,
}

impl StaticAnalyzer {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    async fn analyze(&self, _repository: &str) -> anyhow::Result<Vec<Finding>> {
        Ok(self.findings.clone())
    }
}
