// Runtime Resolver
// Activates a requested Ruby version through whichever version manager is installed

use crate::execution::isolation::inherited_scrubbed_variables;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

/// How a requested runtime version gets activated for a cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSwitch {
    /// No version requested; use whatever is on PATH
    Unset,
    /// Prefix to put in front of every command, e.g. `rvm 2.0.0 do `
    CommandPrefix(String),
    /// Environment variables that activate the version
    EnvOverlay(BTreeMap<String, String>),
    /// The version cannot be activated on this machine
    Unavailable,
}

impl RuntimeSwitch {
    pub fn is_available(&self) -> bool {
        !matches!(self, RuntimeSwitch::Unavailable)
    }
}

/// Trait for runtime version managers
#[async_trait::async_trait]
pub trait RuntimeResolver: Send + Sync {
    /// Resolve how to activate `version`; `None` means nothing was requested
    async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch;
}

/// Translate CI version aliases into names version managers understand
///
/// `1.9.3-19mode` becomes `1.9.3-d19`, `rbx` becomes `rbx-weekly-d18` and
/// `rbx-d19` becomes `rbx-weekly-d19`.
pub fn normalize_version(version: &str) -> String {
    if let Some(rest) = version.strip_suffix("mode") {
        if let Some((head, digits)) = rest.rsplit_once('-') {
            if digits.len() == 2 && digits.chars().all(|c| c.is_ascii_digit()) {
                return format!("{}-d{}", head, digits);
            }
        }
    }

    if version == "rbx" {
        return "rbx-weekly-d18".to_string();
    }

    if let Some(digits) = version.strip_prefix("rbx-d") {
        if digits.len() == 2 && digits.chars().all(|c| c.is_ascii_digit()) {
            return format!("rbx-weekly-d{}", digits);
        }
    }

    version.to_string()
}

/// Strip jruby compatibility suffixes, returning the bare version and its options
fn extract_jruby_options(version: &str) -> (String, BTreeMap<String, String>) {
    let mut options = BTreeMap::new();
    for (flag, opts) in [("-d19", "--1.9"), ("-d18", "--1.8")] {
        if version.contains(flag) {
            options.insert("JRUBY_OPTS".to_string(), opts.to_string());
            return (version.replacen(flag, "", 1), options);
        }
    }
    (version.to_string(), options)
}

/// Where a resolver's helper commands run, and the inherited variables they must not see
#[derive(Debug, Clone, Default)]
pub struct ShellContext {
    working_dir: PathBuf,
    removed: Vec<String>,
}

impl ShellContext {
    /// Run in `working_dir` with the same inherited variables hidden as cell commands
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            removed: inherited_scrubbed_variables(),
        }
    }
}

/// Run a helper command through the shell, returning trimmed stdout on success
async fn capture(context: &ShellContext, command: &str) -> Option<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(&context.working_dir);
    for name in &context.removed {
        cmd.env_remove(name);
    }

    let output = cmd.output().await.ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        tracing::debug!(command, status = %output.status, "version manager command failed");
        None
    }
}

/// rvm: activation through `rvm <version> do <command>`
pub struct RvmResolver {
    context: ShellContext,
}

impl RvmResolver {
    pub fn new(context: ShellContext) -> Self {
        Self { context }
    }
}

#[async_trait::async_trait]
impl RuntimeResolver for RvmResolver {
    async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch {
        let Some(version) = version else {
            return RuntimeSwitch::Unset;
        };

        let prefix = format!("rvm {} do ", normalize_version(version));
        match capture(&self.context, &format!("{}ruby -v", prefix)).await {
            Some(_) => RuntimeSwitch::CommandPrefix(prefix),
            None => RuntimeSwitch::Unavailable,
        }
    }
}

/// chruby and rbenv: activation by pointing PATH and the gem paths at an install
/// directory below a shared rubies root
pub struct RubiesDirResolver {
    root: PathBuf,
}

impl RubiesDirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Install directory whose name (without a `ruby-` prefix) starts with `version`
    fn ruby_root(&self, version: &str) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        candidates.sort();

        candidates.into_iter().find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.strip_prefix("ruby-").unwrap_or(name))
                .is_some_and(|name| name.starts_with(version))
        })
    }

    fn gem_home(ruby_root: &Path) -> Option<PathBuf> {
        let mut homes: Vec<PathBuf> = std::fs::read_dir(ruby_root.join("lib/ruby/gems"))
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        homes.sort();
        homes.into_iter().next()
    }
}

#[async_trait::async_trait]
impl RuntimeResolver for RubiesDirResolver {
    async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch {
        let Some(version) = version else {
            return RuntimeSwitch::Unset;
        };

        let (version, mut overlay) = extract_jruby_options(&normalize_version(version));
        let Some(ruby_root) = self.ruby_root(&version) else {
            return RuntimeSwitch::Unavailable;
        };

        let path = std::env::var("PATH").unwrap_or_default();
        overlay.insert(
            "PATH".to_string(),
            format!("{}:{}", ruby_root.join("bin").display(), path),
        );
        if let Some(gem_home) = Self::gem_home(&ruby_root) {
            let gem_home = gem_home.display().to_string();
            overlay.insert("GEM_HOME".to_string(), gem_home.clone());
            overlay.insert("GEM_PATH".to_string(), gem_home);
        }

        RuntimeSwitch::EnvOverlay(overlay)
    }
}

/// No version manager found: only the ambient runtime is usable
pub struct AmbientRuntime;

#[async_trait::async_trait]
impl RuntimeResolver for AmbientRuntime {
    async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch {
        match version {
            None => RuntimeSwitch::Unset,
            Some(_) => RuntimeSwitch::Unavailable,
        }
    }
}

/// Memoizes another resolver; asking a version manager is slow
pub struct CachedResolver<R> {
    inner: R,
    cache: Mutex<HashMap<Option<String>, RuntimeSwitch>>,
}

impl<R: RuntimeResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl<R: RuntimeResolver> RuntimeResolver for CachedResolver<R> {
    async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch {
        let key = version.map(str::to_string);
        // held across the lookup so concurrent workers don't ask about the same version twice
        let mut cache = self.cache.lock().await;
        if let Some(switch) = cache.get(&key) {
            return switch.clone();
        }

        let switch = self.inner.resolve(version).await;
        cache.insert(key, switch.clone());
        switch
    }
}

/// Pick the resolver for the version manager installed on this machine
///
/// rvm wins over chruby (`RUBY_ROOT` set) which wins over rbenv. Helper
/// commands run in `working_dir`.
pub async fn detect_resolver(working_dir: &Path) -> Arc<dyn RuntimeResolver> {
    let context = ShellContext::new(working_dir);
    if which::which("rvm").is_ok() {
        tracing::debug!("using rvm to switch rubies");
        return Arc::new(CachedResolver::new(RvmResolver::new(context)));
    }

    if let Some(parent) = std::env::var_os("RUBY_ROOT")
        .map(PathBuf::from)
        .and_then(|root| root.parent().map(Path::to_path_buf))
    {
        tracing::debug!(root = %parent.display(), "using RUBY_ROOT to switch rubies");
        return Arc::new(CachedResolver::new(RubiesDirResolver::new(parent)));
    }

    if which::which("rbenv").is_ok() {
        if let Some(root) = capture(&context, "rbenv root").await {
            let versions = PathBuf::from(root).join("versions");
            tracing::debug!(root = %versions.display(), "using rbenv to switch rubies");
            return Arc::new(CachedResolver::new(RubiesDirResolver::new(versions)));
        }
    }

    tracing::debug!("no ruby version manager found");
    Arc::new(AmbientRuntime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("1.9.3-19mode"), "1.9.3-d19");
        assert_eq!(normalize_version("jruby-18mode"), "jruby-d18");
        assert_eq!(normalize_version("rbx"), "rbx-weekly-d18");
        assert_eq!(normalize_version("rbx-d19"), "rbx-weekly-d19");
        assert_eq!(normalize_version("2.0.0"), "2.0.0");
        assert_eq!(normalize_version("rbx-2"), "rbx-2");
    }

    #[test]
    fn test_extract_jruby_options() {
        let (version, opts) = extract_jruby_options("jruby-d19");
        assert_eq!(version, "jruby");
        assert_eq!(opts.get("JRUBY_OPTS").map(String::as_str), Some("--1.9"));

        let (version, opts) = extract_jruby_options("2.0.0");
        assert_eq!(version, "2.0.0");
        assert!(opts.is_empty());
    }

    fn rubies() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ruby-2.0.0-p247/lib/ruby/gems/2.0.0")).unwrap();
        fs::create_dir_all(dir.path().join("1.9.3-p448/bin")).unwrap();
        fs::create_dir_all(dir.path().join("jruby-1.7.4")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_rubies_dir_env_overlay() {
        let dir = rubies();
        let resolver = RubiesDirResolver::new(dir.path());

        let RuntimeSwitch::EnvOverlay(env) = resolver.resolve(Some("2.0")).await else {
            panic!("expected env overlay");
        };
        let root = dir.path().join("ruby-2.0.0-p247");
        assert!(env["PATH"].starts_with(&format!("{}:", root.join("bin").display())));
        assert_eq!(
            env["GEM_HOME"],
            root.join("lib/ruby/gems/2.0.0").display().to_string()
        );
        assert_eq!(env["GEM_HOME"], env["GEM_PATH"]);
    }

    #[tokio::test]
    async fn test_rubies_dir_without_prefix_or_gems() {
        let dir = rubies();
        let resolver = RubiesDirResolver::new(dir.path());

        let RuntimeSwitch::EnvOverlay(env) = resolver.resolve(Some("1.9.3")).await else {
            panic!("expected env overlay");
        };
        assert!(env.contains_key("PATH"));
        assert!(!env.contains_key("GEM_HOME"));
    }

    #[tokio::test]
    async fn test_rubies_dir_jruby_mode() {
        let dir = rubies();
        let resolver = RubiesDirResolver::new(dir.path());

        let RuntimeSwitch::EnvOverlay(env) = resolver.resolve(Some("jruby-19mode")).await else {
            panic!("expected env overlay");
        };
        assert_eq!(env["JRUBY_OPTS"], "--1.9");
    }

    #[tokio::test]
    async fn test_rubies_dir_unknown_version() {
        let dir = rubies();
        let resolver = RubiesDirResolver::new(dir.path());
        assert_eq!(resolver.resolve(Some("3.1")).await, RuntimeSwitch::Unavailable);
        assert_eq!(resolver.resolve(None).await, RuntimeSwitch::Unset);
    }

    #[tokio::test]
    async fn test_ambient_runtime() {
        assert_eq!(AmbientRuntime.resolve(None).await, RuntimeSwitch::Unset);
        assert_eq!(
            AmbientRuntime.resolve(Some("2.0.0")).await,
            RuntimeSwitch::Unavailable
        );
    }

    #[tokio::test]
    async fn test_capture_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let context = ShellContext::new(dir.path());

        let pwd = capture(&context, "pwd -P").await.unwrap();
        assert_eq!(PathBuf::from(pwd), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_capture_hides_removed_variables() {
        let dir = tempfile::tempdir().unwrap();
        let context = ShellContext {
            working_dir: dir.path().to_path_buf(),
            removed: vec!["HOME".to_string()],
        };

        assert_eq!(
            capture(&context, "echo ${HOME:-unset}").await,
            Some("unset".to_string())
        );
        assert_eq!(capture(&context, "exit 3").await, None);
    }

    struct Counting(AtomicUsize);

    #[async_trait::async_trait]
    impl RuntimeResolver for Counting {
        async fn resolve(&self, version: Option<&str>) -> RuntimeSwitch {
            self.0.fetch_add(1, Ordering::SeqCst);
            match version {
                Some(v) => RuntimeSwitch::CommandPrefix(format!("use {} && ", v)),
                None => RuntimeSwitch::Unset,
            }
        }
    }

    #[tokio::test]
    async fn test_cached_resolver_asks_once_per_version() {
        let resolver = CachedResolver::new(Counting(AtomicUsize::new(0)));

        for _ in 0..3 {
            assert_eq!(
                resolver.resolve(Some("2.0")).await,
                RuntimeSwitch::CommandPrefix("use 2.0 && ".into())
            );
        }
        resolver.resolve(Some("1.9")).await;
        resolver.resolve(None).await;

        assert_eq!(resolver.inner.0.load(Ordering::SeqCst), 3);
    }
}
