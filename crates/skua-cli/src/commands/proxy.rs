use anyhow::{Context, Result};
use skua_core::har::HarWriter;
use skua_core::{CaptureType, CaptureTypeSet};
use skua_proxy::{CertificateAuthority, ChainedProxyConfig, ProxyConfig, ProxyServer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct ProxyArgs {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub no_mitm: bool,
    pub trust_all_servers: bool,
    pub chained_proxy: Option<String>,
    pub latency_ms: Option<u64>,
    pub capture: Vec<String>,
}

/// Layer command-line flags over the configuration file
pub fn build_config(args: &ProxyArgs) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default().with_capture_types(CaptureTypeSet::headers()),
    };

    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(bind) = args.bind {
        config = config.with_bind_address(bind);
    }
    if args.no_mitm {
        config = config.with_mitm(false);
    }
    if args.trust_all_servers {
        config = config.with_trust_all_servers(true);
    }
    if let Some(address) = &args.chained_proxy {
        config = config.with_chained_proxy(ChainedProxyConfig::new(address.as_str()));
    }
    if let Some(latency) = args.latency_ms {
        config = config.with_latency(Duration::from_millis(latency));
    }
    if !args.capture.is_empty() {
        let capture_types = args
            .capture
            .iter()
            .map(|name| CaptureType::parse(name))
            .collect::<skua_core::Result<CaptureTypeSet>>()?;
        config = config.with_capture_types(capture_types);
    }

    Ok(config)
}

fn load_ca(cert: Option<&Path>, key: Option<&Path>) -> Result<CertificateAuthority> {
    if let (Some(cert), Some(key)) = (cert, key) {
        tracing::info!("Loading CA certificate from custom paths");
        return Ok(CertificateAuthority::load_from_pem(cert, key)?);
    }

    let (ca, generated) = CertificateAuthority::load_or_generate()?;
    if generated {
        let (cert_path, key_path) = CertificateAuthority::default_paths()?;
        println!("✨ New CA certificate generated and saved to:");
        println!("   Certificate: {}", cert_path.display());
        println!("   Private Key: {}", key_path.display());
        println!();
        println!("⚠️  Install this certificate in your system's trust store");
        println!("   to intercept HTTPS traffic.");
        println!();
    }
    Ok(ca)
}

pub fn execute(args: ProxyArgs) -> Result<()> {
    let config = build_config(&args)?;
    let ca = load_ca(args.cert.as_deref(), args.key.as_deref())?;
    let server = ProxyServer::new(config, ca)?;

    println!("📝 Output will be written to: {}", args.output.display());
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    let har = runtime.block_on(async {
        let addr = server.start().await?;

        println!("✓ Proxy server listening on http://{}", addr);
        println!();
        println!("Configure your browser or application to use this proxy:");
        println!("  HTTP Proxy:  {}", addr);
        println!("  HTTPS Proxy: {}", addr);
        println!();
        println!("Press Ctrl+C to stop capturing and write the HAR file...");

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        println!();
        println!("🛑 Shutting down proxy...");

        // Every exchange has finished once the server is stopped
        server.stop().await?;
        anyhow::Ok(server.end_har().map(|document| document.snapshot()))
    })?;

    match har {
        Some(har) if !har.log.entries.is_empty() => {
            HarWriter::to_file(&har, &args.output)?;
            println!("📊 Captured {} HTTP transactions", har.log.entries.len());
            println!("✅ HAR file written to: {}", args.output.display());
        }
        _ => println!("⚠️  No traffic captured, HAR file not generated"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ProxyArgs {
        ProxyArgs {
            port: None,
            bind: None,
            output: PathBuf::from("out.har"),
            config: None,
            cert: None,
            key: None,
            no_mitm: false,
            trust_all_servers: false,
            chained_proxy: None,
            latency_ms: None,
            capture: Vec::new(),
        }
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skua.json");
        std::fs::write(&path, r#"{"port": 9000, "latencyMs": 10, "mitm": true}"#).unwrap();

        let config = build_config(&ProxyArgs {
            config: Some(path),
            port: Some(9100),
            no_mitm: true,
            capture: vec!["response-content".to_string()],
            ..args()
        })
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.latency_ms, 10);
        assert!(!config.mitm);
        assert!(config.capture_types.contains(CaptureType::ResponseContent));
        assert!(!config.capture_types.contains(CaptureType::RequestHeaders));
    }

    #[test]
    fn test_defaults_capture_headers() {
        let config = build_config(&args()).unwrap();
        assert!(config.capture_types.contains(CaptureType::RequestHeaders));
        assert!(config.capture_types.contains(CaptureType::ResponseHeaders));
    }

    #[test]
    fn test_unknown_capture_type_fails() {
        let result = build_config(&ProxyArgs {
            capture: vec!["everything".to_string()],
            ..args()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_chained_proxy_flag() {
        let config = build_config(&ProxyArgs {
            chained_proxy: Some("corp:3128".to_string()),
            ..args()
        })
        .unwrap();
        assert_eq!(config.chained_proxy.unwrap().address, "corp:3128");
    }
}
