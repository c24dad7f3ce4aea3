use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use crate::platform::WikiPlatform;

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub dry_run: bool,
    pub pages: Vec<String>,
    pub purged: usize,
    pub request_count: usize,
}

/// List every page under the session's team namespace and offset and, unless
/// `dry_run`, blank each of them. The first failure aborts.
pub fn purge_pages<P: WikiPlatform + ?Sized>(platform: &mut P, dry_run: bool) -> Result<PurgeReport> {
    let pages = platform.list_pages().context("failed to list team pages")?;
    let mut purged = 0usize;
    if !dry_run {
        for page in &pages {
            platform.delete_page(page)?;
            info!("purged {page}");
            purged += 1;
        }
    }
    Ok(PurgeReport {
        dry_run,
        purged,
        pages,
        request_count: platform.request_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::purge_pages;
    use crate::platform::tests::MockPlatform;

    fn platform() -> MockPlatform {
        let mut platform = MockPlatform::new("Team", "draft");
        for title in ["Team:Team", "Team:Team/draft", "Team:Team/draft/about", "Team:Other/draft"] {
            platform.pages.insert(title.to_string(), "content".to_string());
        }
        platform
    }

    #[test]
    fn dry_run_only_lists() {
        let mut platform = platform();
        let report = purge_pages(&mut platform, true).expect("purge");
        assert!(report.dry_run);
        assert_eq!(report.pages, vec!["Team:Team/draft", "Team:Team/draft/about"]);
        assert_eq!(report.purged, 0);
        assert!(platform.deleted.is_empty());
    }

    #[test]
    fn purge_blanks_every_listed_page() {
        let mut platform = platform();
        let report = purge_pages(&mut platform, false).expect("purge");
        assert_eq!(report.purged, 2);
        assert_eq!(platform.deleted, vec!["Team:Team/draft", "Team:Team/draft/about"]);
        assert_eq!(platform.pages["Team:Team/draft/about"], "");
        assert_eq!(platform.pages["Team:Team"], "content");
    }
}
