use std::collections::BTreeMap;

use anyhow::Result;
use log::{info, warn};
use serde::Serialize;

use crate::platform::WikiPlatform;

#[derive(Debug, Clone, Default)]
pub struct RedirectPlan {
    /// Page names reached through their canonical spelling and redirected
    /// to their lowercase form.
    pub pages: Vec<String>,
    pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectReport {
    pub success: bool,
    pub created: Vec<(String, String)>,
    pub errors: Vec<String>,
}

/// The redirects to create, in order: team root to `/`, every page to its
/// lowercase form, then every custom redirect. Self-redirects are dropped.
pub fn plan_redirects(plan: &RedirectPlan) -> Vec<(String, String)> {
    let mut redirects = vec![(String::new(), "/".to_string())];
    for page in &plan.pages {
        let lower = page.to_lowercase();
        if lower != *page {
            redirects.push((page.clone(), lower));
        }
    }
    for (source, target) in &plan.custom {
        if source != target {
            redirects.push((source.clone(), target.clone()));
        }
    }
    redirects
}

/// A failed redirect is reported and does not stop the others.
pub fn create_redirects<P: WikiPlatform + ?Sized>(
    plan: &RedirectPlan,
    platform: &mut P,
) -> Result<RedirectReport> {
    let mut created = Vec::new();
    let mut errors = Vec::new();
    for (source, target) in plan_redirects(plan) {
        match platform.redirect(&source, &target) {
            Ok(()) => {
                info!("redirect {source:?} -> {target:?}");
                created.push((source, target));
            }
            Err(error) => {
                warn!("redirect {source:?} -> {target:?} failed: {error:#}");
                errors.push(format!("redirect {source} -> {target}: {error:#}"));
            }
        }
    }
    Ok(RedirectReport {
        success: errors.is_empty(),
        created,
        errors,
    })
}
