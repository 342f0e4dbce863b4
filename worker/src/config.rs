use crate::args::Args;
use serde::Deserialize;
use wheelhouse_common::errors::*;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub master: Option<String>,
    pub file_addr: Option<String>,
    pub label: Option<String>,
    #[serde(default = "default_abi_tag")]
    pub abi_tag: String,
    #[serde(default = "default_platform_tag")]
    pub platform_tag: String,
    #[serde(default = "default_py_tag")]
    pub py_tag: String,
    #[serde(default = "default_pip")]
    pub pip: String,
    pub scratch_dir: Option<std::path::PathBuf>,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

fn default_abi_tag() -> String {
    "cp39m".to_string()
}

fn default_platform_tag() -> String {
    "linux_armv7l".to_string()
}

fn default_py_tag() -> String {
    "cp39".to_string()
}

fn default_pip() -> String {
    "pip3".to_string()
}

fn default_build_timeout() -> u64 {
    3 * 60 * 60
}

fn default_output_limit() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone)]
pub struct Config {
    pub master: String,
    pub file_addr: String,
    pub label: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub py_tag: String,
    pub pip: String,
    pub scratch_dir: std::path::PathBuf,
    pub build_timeout: std::time::Duration,
    pub output_limit: usize,
}

pub fn load(args: &Args) -> Result<Config> {
    let file: ConfigFile = wheelhouse_common::config::load(
        args.config.as_deref(),
        "/etc/wheelhouse/worker.conf",
    )?;

    let master = args
        .master
        .clone()
        .or(file.master)
        .ok_or_else(|| format_err!("No master address configured"))?;
    // The file socket lives next to the dispatch socket unless told
    // otherwise.
    let file_addr = match file.file_addr {
        Some(file_addr) => file_addr,
        None => {
            let host = master
                .rsplit_once(':')
                .map(|(host, _)| host)
                .ok_or_else(|| format_err!("Master address has no port: {:?}", master))?;
            format!("{}:5556", host)
        }
    };
    let label = args
        .label
        .clone()
        .or(file.label)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "anonymous".to_string());
    let scratch_dir = file
        .scratch_dir
        .unwrap_or_else(std::env::temp_dir);

    Ok(Config {
        master,
        file_addr,
        label,
        abi_tag: file.abi_tag,
        platform_tag: file.platform_tag,
        py_tag: file.py_tag,
        pip: file.pip,
        scratch_dir,
        build_timeout: std::time::Duration::from_secs(file.build_timeout_secs),
        output_limit: file.output_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_socket_defaults_to_master_host() {
        let file: ConfigFile = toml::from_str(r#"master = "10.0.0.1:5555""#).unwrap();
        assert_eq!(file.master.as_deref(), Some("10.0.0.1:5555"));
        let args = Args {
            verbose: 0,
            config: None,
            master: Some("10.0.0.1:5555".to_string()),
            label: None,
            check_config: false,
        };
        let config = load(&args).unwrap();
        assert_eq!(config.file_addr, "10.0.0.1:5556");
    }
}
