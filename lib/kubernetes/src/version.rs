use serde::Deserialize;

/// Version info reported by the API server at `/version`.
#[derive(Deserialize, Debug)]
pub struct Version {
    /// Major version of the ApiServer
    pub major: String,

    /// Minor version of the ApiServer
    pub minor: String,

    #[serde(default)]
    pub platform: String,
}
