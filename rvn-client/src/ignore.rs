//! Ignore matchers.
//!
//! Each matcher is a tagged variant persisted in `ignore.json` and
//! produces a predicate over paths relative to the working directory
//! root. Unknown matcher types are rejected at load time.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};
use serde::{Deserialize, Serialize};

use rvn_datastore::RvnError;

/// Persisted matcher description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IgnoreMatcher {
    #[serde(rename = "PrefixIgnoreMatcher")]
    Prefix { path: PathBuf },
    #[serde(rename = "GlobIgnoreMatcher")]
    Glob { pattern: String },
    #[serde(rename = "RegexIgnoreMatcher")]
    Regex { pattern: String },
    #[serde(rename = "SizeIgnoreMatcher")]
    Size {
        #[serde(rename = "minBytes", default, skip_serializing_if = "Option::is_none")]
        min_bytes: Option<u64>,
        #[serde(rename = "maxBytes", default, skip_serializing_if = "Option::is_none")]
        max_bytes: Option<u64>,
    },
    #[serde(rename = "ExtensionIgnoreMatcher")]
    Extension { extensions: Vec<String> },
    #[serde(rename = "CategoryIgnoreMatcher")]
    Category { name: String },
}

/// Built-in categories for [`IgnoreMatcher::Category`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    /// Dot-prefixed files and directories.
    Hidden,
    /// Editor and backup litter (`*.tmp`, `*.swp`, `name~`, `.#name`).
    Temporary,
    /// Version control metadata directories.
    Vcs,
}

impl Category {
    fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "hidden" => Ok(Category::Hidden),
            "temporary" => Ok(Category::Temporary),
            "vcs" => Ok(Category::Vcs),
            other => bail!(RvnError::InvalidInput(format!(
                "unknown ignore category '{}'",
                other
            ))),
        }
    }

    fn matches(self, rel_path: &Path) -> bool {
        match self {
            Category::Hidden => components(rel_path).any(|name| name.starts_with('.')),
            Category::Temporary => {
                let name = match rel_path.file_name().and_then(|name| name.to_str()) {
                    Some(name) => name,
                    None => return false,
                };
                if name.ends_with('~') || name.starts_with(".#") {
                    return true;
                }
                matches!(
                    extension_of(rel_path).as_deref(),
                    Some("tmp") | Some("swp") | Some("swo")
                )
            }
            Category::Vcs => {
                components(rel_path).any(|name| matches!(name, ".git" | ".hg" | ".svn"))
            }
        }
    }
}

fn components(path: &Path) -> impl Iterator<Item = &str> {
    path.iter().filter_map(|component| component.to_str())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

enum CompiledRule {
    Prefix(PathBuf),
    Glob(Vec<MatchEntry>),
    Regex(regex::Regex),
    Size {
        min_bytes: Option<u64>,
        max_bytes: Option<u64>,
    },
    Extension(Vec<String>),
    Category(Category),
}

/// A set of matchers compiled into one predicate.
pub struct CompiledMatcher {
    rules: Vec<CompiledRule>,
}

impl CompiledMatcher {
    /// Compile `matchers`, validating patterns and category names.
    pub fn compile(matchers: &[IgnoreMatcher]) -> Result<Self, Error> {
        let mut rules = Vec::with_capacity(matchers.len());

        for matcher in matchers {
            let rule = match matcher {
                IgnoreMatcher::Prefix { path } => CompiledRule::Prefix(path.clone()),
                IgnoreMatcher::Glob { pattern } => {
                    let entry = MatchEntry::parse_pattern(
                        pattern.as_str(),
                        PatternFlag::PATH_NAME,
                        MatchType::Include,
                    )
                    .map_err(|err| {
                        RvnError::InvalidInput(format!(
                            "malformed glob pattern '{}' - {}",
                            pattern, err
                        ))
                    })?;
                    CompiledRule::Glob(vec![entry])
                }
                IgnoreMatcher::Regex { pattern } => {
                    let regex = regex::Regex::new(pattern).map_err(|err| {
                        RvnError::InvalidInput(format!(
                            "malformed regex pattern '{}' - {}",
                            pattern, err
                        ))
                    })?;
                    CompiledRule::Regex(regex)
                }
                IgnoreMatcher::Size {
                    min_bytes,
                    max_bytes,
                } => CompiledRule::Size {
                    min_bytes: *min_bytes,
                    max_bytes: *max_bytes,
                },
                IgnoreMatcher::Extension { extensions } => CompiledRule::Extension(
                    extensions
                        .iter()
                        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                        .collect(),
                ),
                IgnoreMatcher::Category { name } => CompiledRule::Category(Category::parse(name)?),
            };
            rules.push(rule);
        }

        Ok(Self { rules })
    }

    /// Whether `rel_path` (with the given file size) is ignored.
    pub fn is_ignored(&self, rel_path: &Path, size: u64) -> bool {
        self.rules.iter().any(|rule| match rule {
            CompiledRule::Prefix(prefix) => rel_path.starts_with(prefix),
            CompiledRule::Glob(entries) => {
                use std::os::unix::ffi::OsStrExt;
                let bytes = rel_path.as_os_str().as_bytes();
                matches!(
                    entries.matches(bytes, Some(libc::S_IFREG as u32)),
                    Some(MatchType::Include)
                )
            }
            CompiledRule::Regex(regex) => regex.is_match(&rel_path.to_string_lossy()),
            CompiledRule::Size {
                min_bytes,
                max_bytes,
            } => {
                min_bytes.map_or(true, |min| size >= min)
                    && max_bytes.map_or(true, |max| size <= max)
            }
            CompiledRule::Extension(extensions) => match extension_of(rel_path) {
                Some(ext) => extensions.iter().any(|candidate| candidate == &ext),
                None => false,
            },
            CompiledRule::Category(category) => category.matches(rel_path),
        })
    }
}

/// Load matchers from `path`; a missing file yields an empty set. Unknown
/// matcher types fail with an input error.
pub fn load_matchers<P: AsRef<Path>>(path: P) -> Result<Vec<IgnoreMatcher>, Error> {
    let data = match std::fs::read(path.as_ref()) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    serde_json::from_slice(&data).map_err(|err| {
        RvnError::InvalidInput(format!(
            "malformed ignore file {:?} - {}",
            path.as_ref(),
            err
        ))
        .into()
    })
}

/// Atomically persist `matchers` to `path`.
pub fn store_matchers<P: AsRef<Path>>(path: P, matchers: &[IgnoreMatcher]) -> Result<(), Error> {
    let mut data = serde_json::to_vec_pretty(matchers)?;
    data.push(b'\n');
    rvn_tools::fs::replace_file(path, &data)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ignored(matchers: &[IgnoreMatcher], path: &str, size: u64) -> bool {
        CompiledMatcher::compile(matchers)
            .unwrap()
            .is_ignored(Path::new(path), size)
    }

    #[test]
    fn prefix_matcher_hides_subtrees() {
        let matchers = [IgnoreMatcher::Prefix {
            path: PathBuf::from("build"),
        }];
        assert!(ignored(&matchers, "build/out.o", 1));
        assert!(ignored(&matchers, "build", 1));
        assert!(!ignored(&matchers, "src/build.rs", 1));
    }

    #[test]
    fn glob_matcher_uses_shell_patterns() {
        let matchers = [IgnoreMatcher::Glob {
            pattern: "*.log".to_string(),
        }];
        assert!(ignored(&matchers, "debug.log", 1));
        assert!(ignored(&matchers, "nested/dir/trace.log", 1));
        assert!(!ignored(&matchers, "log.txt", 1));
    }

    #[test]
    fn regex_matcher() {
        let matchers = [IgnoreMatcher::Regex {
            pattern: "^cache/.*\\.bin$".to_string(),
        }];
        assert!(ignored(&matchers, "cache/a.bin", 1));
        assert!(!ignored(&matchers, "data/a.bin", 1));

        assert!(CompiledMatcher::compile(&[IgnoreMatcher::Regex {
            pattern: "(".to_string()
        }])
        .is_err());
    }

    #[test]
    fn size_matcher_bounds() {
        let matchers = [IgnoreMatcher::Size {
            min_bytes: Some(100),
            max_bytes: Some(1000),
        }];
        assert!(!ignored(&matchers, "small", 50));
        assert!(ignored(&matchers, "medium", 500));
        assert!(!ignored(&matchers, "large", 5000));
    }

    #[test]
    fn extension_matcher_is_case_insensitive() {
        let matchers = [IgnoreMatcher::Extension {
            extensions: vec!["iso".to_string(), ".Mkv".to_string()],
        }];
        assert!(ignored(&matchers, "image.ISO", 1));
        assert!(ignored(&matchers, "movie.mkv", 1));
        assert!(!ignored(&matchers, "notes.txt", 1));
    }

    #[test]
    fn category_matchers() {
        let hidden = [IgnoreMatcher::Category {
            name: "hidden".to_string(),
        }];
        assert!(ignored(&hidden, ".config/settings", 1));
        assert!(ignored(&hidden, "dir/.secret", 1));
        assert!(!ignored(&hidden, "visible/file", 1));

        let temporary = [IgnoreMatcher::Category {
            name: "temporary".to_string(),
        }];
        assert!(ignored(&temporary, "doc.txt~", 1));
        assert!(ignored(&temporary, "scratch.tmp", 1));
        assert!(!ignored(&temporary, "doc.txt", 1));

        assert!(CompiledMatcher::compile(&[IgnoreMatcher::Category {
            name: "nonsense".to_string()
        }])
        .is_err());
    }

    #[test]
    fn json_round_trip_with_type_tags() {
        let matchers = vec![
            IgnoreMatcher::Glob {
                pattern: "*.o".to_string(),
            },
            IgnoreMatcher::Size {
                min_bytes: None,
                max_bytes: Some(1 << 30),
            },
        ];

        let json = serde_json::to_string(&matchers).unwrap();
        assert!(json.contains("GlobIgnoreMatcher"));
        assert!(json.contains("SizeIgnoreMatcher"));
        assert!(json.contains("maxBytes"));

        let parsed: Vec<IgnoreMatcher> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, matchers);
    }

    #[test]
    fn unknown_matcher_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ignore.json");
        std::fs::write(&path, br#"[{"type": "FancyIgnoreMatcher"}]"#).unwrap();

        let err = load_matchers(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RvnError>(),
            Some(RvnError::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_ignore_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_matchers(dir.path().join("none.json")).unwrap().is_empty());
    }
}
