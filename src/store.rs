//! Content Store: page and attachment persistence over the git working
//! copy.
//!
//! Pages are markdown files with a typed metadata header, stored under
//! `pages/<path>.md`; attachments live under
//! `attachments/<path>/<filename>`. Path validation here is the sole
//! defense against traversal out of the tree and runs before every read
//! or write derived from caller input.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::WikiError;
use crate::frontmatter::{self, MetaValue, Metadata};
use crate::git::{ChangeEntry, GitClient, GitRunner};

/// Metadata keys the store owns. User-supplied values for these are
/// discarded on save and they never appear in edit forms.
pub const SYSTEM_MANAGED_FIELDS: &[&str] = &["last_updated"];

/// Metadata keys that carry a page's content date, checked in priority
/// order after normalization (lowercased, underscores removed).
const CONTENT_DATE_FIELDS: &[&str] = &["lastupdated", "updated", "date", "modified", "lastmodified"];

pub fn is_system_field(key: &str) -> bool {
    SYSTEM_MANAGED_FIELDS.contains(&key)
}

/// Validate and normalize a page path.
///
/// Paths may be written with surrounding slashes (`/a/b/` names the same
/// page as `a/b`); a bare leading slash is an absolute path and rejected.
/// Traversal sequences and null bytes are rejected outright.
pub fn validate_path(path: &str) -> Result<String, WikiError> {
    if path.is_empty() {
        return Err(WikiError::InvalidPath("path cannot be empty".into()));
    }
    if path.contains('\0') {
        return Err(WikiError::InvalidPath("path cannot contain null bytes".into()));
    }
    if path.contains("..") {
        return Err(WikiError::InvalidPath("path cannot contain '..'".into()));
    }

    let mut p = path;
    while p.len() > 1 && p.starts_with('/') && p.ends_with('/') {
        p = &p[1..p.len() - 1];
    }
    let p = p.strip_suffix('/').unwrap_or(p);

    if p.starts_with('/') {
        return Err(WikiError::InvalidPath("path cannot be absolute".into()));
    }
    if p.is_empty() {
        return Err(WikiError::InvalidPath("path cannot be empty".into()));
    }

    Ok(p.to_string())
}

/// Validate an attachment filename: a single path segment, no traversal.
pub fn validate_filename(filename: &str) -> Result<&str, WikiError> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\0')
    {
        return Err(WikiError::InvalidPath("invalid attachment filename".into()));
    }
    Ok(filename)
}

/// `my-page_name` -> `My Page Name`.
pub fn humanize_slug(slug: &str) -> String {
    slug.replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A wiki page snapshot. Owned by the store; everything downstream gets
/// copies.
#[derive(Debug, Clone)]
pub struct Page {
    pub path: String,
    pub content: String,
    pub last_modified: Option<NaiveDateTime>,
    pub metadata: Metadata,
}

/// One metadata field prepared for form rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct EditableField {
    pub key: String,
    pub label: String,
    pub input_type: &'static str,
    pub value: String,
}

impl Page {
    /// Explicit `title` metadata, else the last path segment humanized.
    pub fn title(&self) -> String {
        match self.metadata.get("title") {
            Some(MetaValue::Str(title)) => title.clone(),
            Some(other) => other.to_string(),
            None => humanize_slug(self.path.rsplit('/').next().unwrap_or(&self.path)),
        }
    }

    /// First date-like metadata value, else the file mtime.
    pub fn content_date(&self) -> Option<NaiveDateTime> {
        content_date_from(&self.metadata).or(self.last_modified)
    }

    /// Metadata for display: everything except the title.
    pub fn display_metadata(&self) -> Vec<(&str, &MetaValue)> {
        self.metadata.iter().filter(|(key, _)| *key != "title").collect()
    }

    /// Metadata fields with type info for form rendering, excluding the
    /// title and system-managed fields.
    pub fn editable_metadata(&self) -> Vec<EditableField> {
        self.metadata
            .iter()
            .filter(|(key, _)| *key != "title" && !is_system_field(key))
            .map(|(key, value)| EditableField {
                key: key.to_string(),
                label: humanize_slug(key),
                input_type: value.input_type(),
                value: value.form_value(),
            })
            .collect()
    }
}

fn content_date_from(metadata: &Metadata) -> Option<NaiveDateTime> {
    let normalized: BTreeMap<String, &MetaValue> = metadata
        .iter()
        .map(|(key, value)| (key.to_lowercase().replace('_', ""), value))
        .collect();

    for field in CONTENT_DATE_FIELDS {
        if let Some(value) = normalized.get(*field) {
            if let Some(dt) = value.as_datetime() {
                return Some(dt);
            }
        }
    }
    None
}

/// Batch-read summary used by the widget caches.
#[derive(Debug, Clone)]
pub struct PageSummary {
    pub path: String,
    pub title: String,
    pub content_date: Option<NaiveDateTime>,
}

pub struct ContentStore {
    pages_path: PathBuf,
    attachments_path: PathBuf,
    git: GitClient,
}

impl ContentStore {
    pub fn new(repo_path: PathBuf, branch: String, remote_url: String) -> Self {
        let git = GitClient::new(repo_path.clone(), branch, remote_url);
        Self::with_git(repo_path, git)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.repo.path.clone(),
            config.repo.branch.clone(),
            config.repo.remote_url.clone(),
        )
    }

    pub fn with_runner(
        repo_path: PathBuf,
        branch: String,
        remote_url: String,
        runner: Box<dyn GitRunner>,
    ) -> Self {
        let git = GitClient::with_runner(repo_path.clone(), branch, remote_url, runner);
        Self::with_git(repo_path, git)
    }

    fn with_git(repo_path: PathBuf, git: GitClient) -> Self {
        Self {
            pages_path: repo_path.join("pages"),
            attachments_path: repo_path.join("attachments"),
            git,
        }
    }

    fn page_file(&self, path: &str) -> PathBuf {
        self.pages_path.join(format!("{}.md", path))
    }

    /// Read a page. `Ok(None)` means the page does not exist; callers use
    /// that to distinguish a new page from an edit.
    pub fn get(&self, path: &str) -> Result<Option<Page>> {
        let path = validate_path(path)?;
        let file_path = self.page_file(&path);
        if !file_path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&file_path)
            .with_context(|| format!("failed to read page file {}", file_path.display()))?;
        let last_modified = file_mtime(&file_path);
        let (metadata, content) = frontmatter::parse(&raw);

        Ok(Some(Page {
            path,
            content,
            last_modified,
            metadata,
        }))
    }

    /// Write a page, detecting no-op saves before touching the file.
    ///
    /// The new `(content, user metadata)` is compared against what is
    /// stored (system fields excluded on both sides); an identical save
    /// returns the existing page with `content_changed = false` so
    /// callers can skip the commit/push entirely. A genuine change stamps
    /// `last_updated` and writes atomically.
    pub fn save(
        &self,
        path: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(Page, bool)> {
        let path = validate_path(path)?;
        let file_path = self.page_file(&path);

        // Any user-supplied value for a system field is discarded.
        let mut metadata = metadata;
        for field in SYSTEM_MANAGED_FIELDS {
            metadata.remove(field);
        }

        if let Some(existing) = self.get(&path)? {
            let existing_user = user_fields(&existing.metadata);
            if existing.content == content && existing_user == user_fields(&metadata) {
                return Ok((existing, false));
            }
        }

        metadata.insert("last_updated", MetaValue::DateTime(now_local()));

        let raw = frontmatter::serialize(&metadata, content);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_atomic(&file_path, raw.as_bytes())?;

        let page = Page {
            path,
            content: content.to_string(),
            last_modified: Some(now_local()),
            metadata,
        };
        Ok((page, true))
    }

    /// Remove a page file. `Ok(false)` if it did not exist.
    pub fn delete(&self, path: &str) -> Result<bool> {
        let path = validate_path(path)?;
        let file_path = self.page_file(&path);
        if !file_path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&file_path)
            .with_context(|| format!("failed to delete {}", file_path.display()))?;
        Ok(true)
    }

    /// Relocate a page and, optionally, its attachment directory.
    pub fn move_page(&self, old_path: &str, new_path: &str, move_attachments: bool) -> Result<bool> {
        let old_path = validate_path(old_path)?;
        let new_path = validate_path(new_path)?;

        let old_file = self.page_file(&old_path);
        if !old_file.exists() {
            return Ok(false);
        }

        let new_file = self.page_file(&new_path);
        if let Some(parent) = new_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&old_file, &new_file)
            .with_context(|| format!("failed to move page to {}", new_file.display()))?;

        if move_attachments {
            let old_dir = self.attachments_path.join(&old_path);
            if old_dir.exists() {
                let new_dir = self.attachments_path.join(&new_path);
                if let Some(parent) = new_dir.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&old_dir, &new_dir)
                    .with_context(|| format!("failed to move attachments to {}", new_dir.display()))?;
            }
        }

        Ok(true)
    }

    /// All page paths, alphabetical, with optional pagination.
    pub fn list_pages(&self, limit: Option<usize>, offset: usize) -> Vec<String> {
        let mut pages: Vec<String> = self.walk_page_files().into_iter().map(|(p, _)| p).collect();
        pages.sort();

        let pages = pages.into_iter().skip(offset);
        match limit {
            Some(limit) => pages.take(limit).collect(),
            None => pages.collect(),
        }
    }

    /// Batch path -> title mapping. Reads only metadata headers, never
    /// full pages; this backs the per-request sidebar.
    pub fn get_page_titles(&self) -> BTreeMap<String, String> {
        let mut titles = BTreeMap::new();

        for (path, file_path) in self.walk_page_files() {
            let fallback = || humanize_slug(path.rsplit('/').next().unwrap_or(&path));
            let title = match frontmatter::read_header(&file_path) {
                Ok(metadata) => match metadata.get("title") {
                    Some(MetaValue::Str(title)) => title.clone(),
                    Some(other) => other.to_string(),
                    None => fallback(),
                },
                Err(e) => {
                    tracing::warn!(page = %path, error = %e, "failed to read page header");
                    fallback()
                }
            };
            titles.insert(path, title);
        }

        titles
    }

    /// Batch `(path, title, content date)` read with the same
    /// header-only discipline as [`get_page_titles`](Self::get_page_titles).
    pub fn get_pages_with_dates(&self) -> Vec<PageSummary> {
        let mut results = Vec::new();

        for (path, file_path) in self.walk_page_files() {
            let metadata = match frontmatter::read_header(&file_path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(page = %path, error = %e, "failed to read page header");
                    continue;
                }
            };

            let title = match metadata.get("title") {
                Some(MetaValue::Str(title)) => title.clone(),
                Some(other) => other.to_string(),
                None => humanize_slug(path.rsplit('/').next().unwrap_or(&path)),
            };
            let content_date = content_date_from(&metadata).or_else(|| file_mtime(&file_path));

            results.push(PageSummary {
                path,
                title,
                content_date,
            });
        }

        results
    }

    fn walk_page_files(&self) -> Vec<(String, PathBuf)> {
        if !self.pages_path.exists() {
            return Vec::new();
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.pages_path).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let relative = file_path.strip_prefix(&self.pages_path).unwrap_or(file_path);
            let page_path = relative
                .with_extension("")
                .to_string_lossy()
                .replace('\\', "/");
            files.push((page_path, file_path.to_path_buf()));
        }
        files
    }

    // ---- attachments ----

    pub fn attachment_path(&self, page_path: &str, filename: &str) -> Result<PathBuf, WikiError> {
        let page_path = validate_path(page_path)?;
        let filename = validate_filename(filename)?;
        Ok(self.attachments_path.join(page_path).join(filename))
    }

    pub fn save_attachment(
        &self,
        page_path: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        let file_path = self.attachment_path(page_path, filename)?;
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file_path, content)
            .with_context(|| format!("failed to write attachment {}", file_path.display()))?;
        Ok(file_path)
    }

    pub fn read_attachment(&self, page_path: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        let file_path = self.attachment_path(page_path, filename)?;
        if !file_path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&file_path)?))
    }

    pub fn list_attachments(&self, page_path: &str) -> Result<Vec<String>> {
        let page_path = validate_path(page_path)?;
        let dir = self.attachments_path.join(page_path);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete_attachment(&self, page_path: &str, filename: &str) -> Result<bool> {
        let file_path = self.attachment_path(page_path, filename)?;
        if !file_path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&file_path)?;
        Ok(true)
    }

    // ---- git delegation ----

    pub fn ensure_repo_exists(&self) -> Result<(), WikiError> {
        self.git.ensure_repo_exists()?;
        // Local-init repos get these from ensure_repo_exists; cloned
        // repos may predate the attachments tree.
        for dir in [&self.pages_path, &self.attachments_path] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| WikiError::GitOperation(format!("cannot create {}: {}", dir.display(), e)))?;
            }
        }
        Ok(())
    }

    pub fn commit_and_push(&self, message: &str) -> Result<bool, WikiError> {
        self.git.commit_and_push(message)
    }

    pub fn pull(&self) -> Result<bool, WikiError> {
        self.git.pull()
    }

    pub fn recent_changes(&self, limit: usize) -> Vec<ChangeEntry> {
        self.git.recent_changes(limit)
    }

    pub fn source_url(&self, page_path: &str) -> Option<String> {
        self.git.source_url(page_path)
    }
}

/// User-editable view of a metadata mapping, for change comparison.
fn user_fields(metadata: &Metadata) -> BTreeMap<&str, &MetaValue> {
    metadata
        .iter()
        .filter(|(key, _)| !is_system_field(key))
        .collect()
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

fn file_mtime(path: &Path) -> Option<NaiveDateTime> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let dt: chrono::DateTime<Local> = modified.into();
    Some(dt.naive_local())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("md.tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
