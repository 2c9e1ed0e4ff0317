//! TLS client context shared by every server's pool.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::TlsSettings;
use crate::error::{RingError, RingResult};

/// Build the connector for `settings`.
///
/// Servers are verified against `cafile` when given, otherwise against the
/// bundled web PKI roots. A client certificate is presented when `certfile`
/// is set; its key comes from `keyfile`, or from `certfile` itself.
pub fn connector(settings: &TlsSettings) -> RingResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    match &settings.cafile {
        Some(cafile) => {
            for cert in load_certs(cafile)? {
                roots
                    .add(cert)
                    .map_err(|e| RingError::Tls(format!("{}: {}", cafile.display(), e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match &settings.certfile {
        Some(certfile) => {
            let chain = load_certs(certfile)?;
            let key = load_key(settings.keyfile.as_deref().unwrap_or(certfile))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| RingError::Tls(format!("client certificate: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn open(path: &Path) -> RingResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| RingError::Tls(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> RingResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RingError::Tls(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(RingError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> RingResult<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RingError::Tls(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| RingError::Tls(format!("{}: no private key found", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_default_roots() {
        assert!(connector(&TlsSettings::default()).is_ok());
    }

    #[test]
    fn test_missing_cafile() {
        let settings = TlsSettings {
            cafile: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsSettings::default()
        };
        assert!(matches!(connector(&settings), Err(RingError::Tls(_))));
    }

    #[test]
    fn test_cafile_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a certificate").unwrap();

        let settings = TlsSettings {
            cafile: Some(file.path().to_path_buf()),
            ..TlsSettings::default()
        };
        let err = match connector(&settings) {
            Err(e) => e,
            Ok(_) => panic!("a file without certificates was accepted"),
        };
        assert!(err.to_string().contains("no certificates found"));
    }
}
