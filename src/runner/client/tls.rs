//! The https connector, configured with the api server's CA and the client's own certificate
use crate::config::{CAData, ClientConfig, Credentials};

use hyper::client::HttpConnector;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;

use std::io;

pub(super) fn https_connector(config: &ClientConfig) -> io::Result<HttpsConnector<HttpConnector>> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let mut ssl = SslConnector::builder(SslMethod::tls())?;
    ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;

    match config.ca_data.as_ref() {
        Some(CAData::Contents(encoded)) => {
            let pem = decode("certificate-authority-data", encoded)?;
            trust(&mut ssl, &pem)?;
        }
        Some(CAData::File(path)) => ssl.set_ca_file(path.as_str())?,
        None => {}
    }

    match &config.credentials {
        Credentials::Pem {
            certificate_base64,
            private_key_base64,
        } => {
            let certificate = decode("client-certificate-data", certificate_base64)?;
            let key = decode("client-key-data", private_key_base64)?;
            identify(&mut ssl, &certificate, &key)?;
        }
        Credentials::PemPath {
            certificate_path,
            private_key_path,
        } => {
            let certificate = std::fs::read(certificate_path)?;
            let key = std::fs::read(private_key_path)?;
            identify(&mut ssl, &certificate, &key)?;
        }
        Credentials::Header(_) => {}
    }

    if config.verify_ssl_certs {
        ssl.set_verify(SslVerifyMode::PEER);
    } else {
        log::warn!("TLS certificate verification is disabled, connections to the api server are insecure");
        ssl.set_verify(SslVerifyMode::NONE);
    }

    Ok(HttpsConnector::with_connector(http, ssl)?)
}

/// Adds every certificate in the PEM bundle to the trusted store
fn trust(ssl: &mut SslConnectorBuilder, pem: &[u8]) -> io::Result<()> {
    let store = ssl.cert_store_mut();
    for certificate in X509::stack_from_pem(pem)? {
        store.add_cert(certificate)?;
    }
    Ok(())
}

fn identify(ssl: &mut SslConnectorBuilder, certificate_pem: &[u8], key_pem: &[u8]) -> io::Result<()> {
    let certificate = X509::from_pem(certificate_pem)?;
    let key = PKey::private_key_from_pem(key_pem)?;
    ssl.set_certificate(&*certificate)?;
    ssl.set_private_key(&*key)?;
    ssl.check_private_key()?;
    Ok(())
}

fn decode(field: &str, value: &str) -> io::Result<Vec<u8>> {
    base64::decode(value.trim()).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid base64 content of {}: {}", field, err),
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(ca_data: Option<CAData>, credentials: Credentials) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: "https://10.0.0.1:6443".to_owned(),
            credentials,
            ca_data,
            user_agent: "siab-operator".to_owned(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        }
    }

    #[test]
    fn token_credentials_need_no_certificates() {
        let config = config(None, Credentials::bearer_token("abc"));
        assert!(https_connector(&config).is_ok());
    }

    #[test]
    fn invalid_inline_data_names_the_field() {
        let bad_ca = config(
            Some(CAData::Contents("not base64!".to_owned())),
            Credentials::bearer_token("abc"),
        );
        let err = https_connector(&bad_ca).err().expect("should fail");
        assert!(err.to_string().contains("certificate-authority-data"));

        let bad_key = config(
            None,
            Credentials::Pem {
                certificate_base64: base64::encode("cert"),
                private_key_base64: "???".to_owned(),
            },
        );
        let err = https_connector(&bad_key).err().expect("should fail");
        assert!(err.to_string().contains("client-key-data"));
    }
}
