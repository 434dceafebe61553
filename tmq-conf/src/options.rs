/// Startup options supplied by the embedding program.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra config file, layered over `/etc/tmq/tmq.toml` and `./tmq.toml`, under `TMQ__*` env
    pub cfg_name: Option<String>,
}

impl Options {
    #[inline]
    pub fn with_config<N: Into<String>>(name: N) -> Self {
        Self { cfg_name: Some(name.into()) }
    }
}
