use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("not initialized: run 'plugforge init'")]
    NotInitialized,

    #[error("already initialized: {0} exists")]
    AlreadyInitialized(String),

    #[error("unable to load configuration from {path}: {reason}; run 'plugforge init'")]
    ConfigLoad { path: String, reason: String },

    #[error("registry file {path} is unreadable: {reason}")]
    Registry { path: String, reason: String },

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("addon not found: {0}")]
    AddonNotFound(String),

    #[error("duplicate feature name '{0}'")]
    DuplicateName(String),

    #[error("repository already registered: {0}")]
    DuplicateRepository(String),

    #[error("feature '{name}' is already provided by repository {owner}")]
    Conflict { name: String, owner: String },

    #[error("feature '{name}' refers to unregistered repository {repo}")]
    DanglingFeature { name: String, repo: String },

    #[error("invalid name '{0}': must be alphanumeric with '-', '_' or '.'")]
    InvalidName(String),

    #[error("unsupported repository URL {0}: should either end in '.git' or be an HTTP/HTTPS URL")]
    UnsupportedScheme(String),

    #[error("unable to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("git failed for {url}: {reason}")]
    Vcs { url: String, reason: String },

    #[error("no features manifest found in {0}")]
    ManifestMissing(String),

    #[error("unable to start {binary}: {reason}")]
    ProcessStart { binary: String, reason: String },

    #[error("{binary} {args} exited with {status}")]
    ProcessFailed {
        binary: String,
        args: String,
        status: String,
    },

    #[error("{binary} was cancelled")]
    Cancelled { binary: String },

    #[error("{binary} not found on PATH")]
    BinaryNotFound { binary: String },

    #[error("unable to build {component}: {reason}")]
    BuildProcess { component: String, reason: String },

    #[error("unable to publish {component}: {reason}")]
    Publish { component: String, reason: String },

    #[error("unable to deploy: {0}")]
    Deploy(String),

    #[error("invalid answer for '{question}': {reason}")]
    InvalidAnswer { question: String, reason: String },

    #[error("invalid addon configuration for {addon}: {reason}")]
    InvalidAddonConfig { addon: String, reason: String },

    #[error("docker user is required to reference images; pass --docker-user or run 'plugforge configure --docker-user'")]
    MissingDockerUser,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
