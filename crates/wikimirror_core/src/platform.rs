//! Contract between the migration pipeline and the wiki it publishes to.

use std::path::Path;

use anyhow::Result;
use log::warn;

use crate::error::UploadError;

#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub local_path: &'a Path,
    /// Appended to the session's own offset below the team namespace.
    pub namespace_offset: &'a str,
    pub is_asset: bool,
    pub force: bool,
}

/// An authenticated session against the target wiki. Team, year and base
/// offset are fixed when the session is created.
pub trait WikiPlatform {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn logout(&mut self) -> Result<()>;
    /// Publish a page/stylesheet/script, or upload an asset. Returns the
    /// remote identifier (page title or file title).
    fn upload(&mut self, request: &UploadRequest<'_>) -> Result<String, UploadError>;
    fn resolve_asset_url(&mut self, remote: &str) -> Result<String>;
    /// Paths are relative to the team root; `""` is the root itself.
    fn redirect(&mut self, source: &str, target: &str) -> Result<()>;
    /// Every page under the team namespace and session offset.
    fn list_pages(&mut self) -> Result<Vec<String>>;
    fn delete_page(&mut self, page: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

/// Log in, run `work`, and log out again whatever `work` returned.
pub fn with_session<P, T, F>(platform: &mut P, username: &str, password: &str, work: F) -> Result<T>
where
    P: WikiPlatform + ?Sized,
    F: FnOnce(&mut P) -> Result<T>,
{
    platform.login(username, password)?;
    let outcome = work(platform);
    match (outcome, platform.logout()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(error)) => Err(error.context("failed to log out")),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(logout_error)) => {
            warn!("failed to log out: {logout_error:#}");
            Err(error)
        }
    }
}

/// `Team:<team>` followed by each non-empty offset segment.
pub fn team_namespace(team: &str, offsets: &[&str]) -> String {
    let mut title = format!("Team:{team}");
    for segment in offsets
        .iter()
        .flat_map(|offset| offset.split('/'))
        .filter(|segment| !segment.is_empty())
    {
        title.push('/');
        title.push_str(segment);
    }
    title
}

/// Title of a path below the team root, keeping a trailing slash so the
/// root redirect (`""` -> `"/"`) addresses two distinct pages.
pub fn team_path_title(team: &str, path: &str) -> String {
    if path.is_empty() {
        format!("Team:{team}")
    } else {
        format!("Team:{team}/{}", path.trim_start_matches('/'))
    }
}

/// Page name for a mirrored text file: extension dropped, `.min` becomes
/// `-min`, and `index` addresses the namespace root.
pub fn remote_page_name(file_name: &str) -> String {
    let stem = [".html", ".htm", ".css", ".js"]
        .iter()
        .find_map(|extension| file_name.strip_suffix(extension))
        .unwrap_or(file_name);
    let stem = match stem.strip_suffix(".min") {
        Some(base) => format!("{base}-min"),
        None => stem.to_string(),
    };
    if stem == "index" { String::new() } else { stem }
}

pub fn page_title(team: &str, offsets: &[&str], file_name: &str) -> String {
    let name = remote_page_name(file_name);
    let mut all = offsets.to_vec();
    all.push(&name);
    team_namespace(team, &all)
}

pub fn asset_title(team: &str, file_name: &str) -> String {
    format!("File:T--{team}--{file_name}")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::path::PathBuf;

    use anyhow::{Result, bail};

    use super::{
        UploadRequest, WikiPlatform, asset_title, page_title, remote_page_name, team_namespace,
        team_path_title, with_session,
    };
    use crate::error::UploadError;

    /// In-memory wiki. Pages keep the content they were published with.
    #[derive(Default)]
    pub(crate) struct MockPlatform {
        pub(crate) team: String,
        pub(crate) offset: String,
        pub(crate) logged_in: bool,
        pub(crate) logouts: usize,
        /// Asset file names that already exist remotely.
        pub(crate) existing_files: BTreeSet<String>,
        /// File names whose upload fails with a rejection.
        pub(crate) rejected: BTreeSet<String>,
        pub(crate) session_uploads: BTreeMap<PathBuf, String>,
        pub(crate) upload_calls: Vec<PathBuf>,
        pub(crate) pages: BTreeMap<String, String>,
        pub(crate) redirects: Vec<(String, String)>,
        pub(crate) deleted: Vec<String>,
        pub(crate) request_count: usize,
    }

    impl MockPlatform {
        pub(crate) fn new(team: &str, offset: &str) -> Self {
            Self {
                team: team.to_string(),
                offset: offset.to_string(),
                logged_in: true,
                ..Self::default()
            }
        }
    }

    impl WikiPlatform for MockPlatform {
        fn login(&mut self, username: &str, _password: &str) -> Result<()> {
            self.request_count += 1;
            if username.is_empty() {
                bail!("login failed");
            }
            self.logged_in = true;
            Ok(())
        }

        fn logout(&mut self) -> Result<()> {
            self.request_count += 1;
            self.logged_in = false;
            self.logouts += 1;
            Ok(())
        }

        fn upload(&mut self, request: &UploadRequest<'_>) -> Result<String, UploadError> {
            if !self.logged_in {
                return Err(UploadError::NotLoggedIn);
            }
            if let Some(remote) = self.session_uploads.get(request.local_path) {
                return Err(UploadError::AlreadyUploadedInSession {
                    remote: remote.clone(),
                });
            }
            self.request_count += 1;
            self.upload_calls.push(request.local_path.to_path_buf());

            let file_name = request
                .local_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            if self.rejected.contains(&file_name) {
                return Err(UploadError::Rejected {
                    message: format!("verification-error for {file_name}"),
                });
            }

            let remote = if request.is_asset {
                fs::read(request.local_path).map_err(|error| {
                    UploadError::Transport(anyhow::Error::from(error).context(format!(
                        "failed to read {}",
                        request.local_path.display()
                    )))
                })?;
                let title = asset_title(&self.team, &file_name);
                if self.existing_files.contains(&file_name) && !request.force {
                    return Err(UploadError::FileAlreadyUploaded { remote: title });
                }
                title
            } else {
                let content = fs::read_to_string(request.local_path)
                    .map_err(|error| UploadError::Transport(error.into()))?;
                let title = page_title(
                    &self.team,
                    &[self.offset.as_str(), request.namespace_offset],
                    &file_name,
                );
                self.pages.insert(title.clone(), content);
                title
            };
            self.session_uploads
                .insert(request.local_path.to_path_buf(), remote.clone());
            Ok(remote)
        }

        fn resolve_asset_url(&mut self, remote: &str) -> Result<String> {
            self.request_count += 1;
            let name = remote.trim_start_matches("File:");
            Ok(format!("https://static.example.org/{}/{name}", self.team))
        }

        fn redirect(&mut self, source: &str, target: &str) -> Result<()> {
            self.request_count += 1;
            self.redirects.push((
                team_path_title(&self.team, source),
                team_path_title(&self.team, target),
            ));
            Ok(())
        }

        fn list_pages(&mut self) -> Result<Vec<String>> {
            self.request_count += 1;
            let prefix = team_namespace(&self.team, &[self.offset.as_str()]);
            Ok(self
                .pages
                .keys()
                .filter(|title| title.starts_with(&prefix))
                .cloned()
                .collect())
        }

        fn delete_page(&mut self, page: &str) -> Result<()> {
            self.request_count += 1;
            if let Some(content) = self.pages.get_mut(page) {
                content.clear();
            }
            self.deleted.push(page.to_string());
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[test]
    fn session_is_closed_on_success_and_failure() {
        let mut platform = MockPlatform::new("Team", "");
        platform.logged_in = false;

        let value = with_session(&mut platform, "user", "pass", |platform| {
            assert!(platform.logged_in);
            Ok(7)
        })
        .expect("session");
        assert_eq!(value, 7);
        assert_eq!(platform.logouts, 1);

        let error = with_session(&mut platform, "user", "pass", |_| -> Result<()> {
            bail!("publish failed")
        })
        .expect_err("must fail");
        assert_eq!(error.to_string(), "publish failed");
        assert_eq!(platform.logouts, 2);
        assert!(!platform.logged_in);
    }

    #[test]
    fn failed_login_skips_work_and_logout() {
        let mut platform = MockPlatform::new("Team", "");
        let result = with_session(&mut platform, "", "pass", |_| Ok(()));
        assert!(result.is_err());
        assert_eq!(platform.logouts, 0);
    }

    #[test]
    fn asset_upload_reads_the_local_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let present = temp.path().join("logo.png");
        fs::write(&present, b"\x89PNG").expect("write asset");
        let missing = temp.path().join("missing.png");
        let mut platform = MockPlatform::new("Team", "");

        let remote = platform
            .upload(&UploadRequest {
                local_path: &present,
                namespace_offset: "",
                is_asset: true,
                force: false,
            })
            .expect("upload");
        assert_eq!(remote, "File:T--Team--logo.png");

        let error = platform
            .upload(&UploadRequest {
                local_path: &missing,
                namespace_offset: "",
                is_asset: true,
                force: false,
            })
            .expect_err("missing file");
        assert!(matches!(error, UploadError::Transport(_)));
        assert!(error.to_string().contains("missing.png"));
    }

    #[test]
    fn page_names_drop_extensions_and_index() {
        assert_eq!(remote_page_name("about.html"), "about");
        assert_eq!(remote_page_name("index.html"), "");
        assert_eq!(remote_page_name("style.css"), "style");
        assert_eq!(remote_page_name("jquery.min.js"), "jquery-min");
        assert_eq!(remote_page_name("theme.min.css"), "theme-min");
    }

    #[test]
    fn titles_nest_offsets_under_team() {
        assert_eq!(team_namespace("TU_Darmstadt", &[]), "Team:TU_Darmstadt");
        assert_eq!(
            page_title("TU_Darmstadt", &["test", "css"], "style.css"),
            "Team:TU_Darmstadt/test/css/style"
        );
        assert_eq!(
            page_title("TU_Darmstadt", &["", ""], "index.html"),
            "Team:TU_Darmstadt"
        );
        assert_eq!(
            page_title("TU_Darmstadt", &["test/", ""], "about.html"),
            "Team:TU_Darmstadt/test/about"
        );
        assert_eq!(asset_title("TU_Darmstadt", "logo.png"), "File:T--TU_Darmstadt--logo.png");
    }

    #[test]
    fn root_redirect_titles_differ() {
        assert_eq!(team_path_title("Team", ""), "Team:Team");
        assert_eq!(team_path_title("Team", "/"), "Team:Team/");
        assert_eq!(team_path_title("Team", "Description"), "Team:Team/Description");
    }
}
