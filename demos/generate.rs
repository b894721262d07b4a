use certissuer::config::{AuthorityConfig, IssuerConfig};
use certissuer::error::CertIssuerError;
use certissuer::service::{CertificateService, CsrRequest};

#[tokio::main]
async fn main() -> Result<(), CertIssuerError> {
    // An optional TOML file as the first argument; a local CA otherwise.
    let config = match std::env::args().nth(1) {
        Some(path) => IssuerConfig::load(path)?,
        None => IssuerConfig {
            authority: AuthorityConfig::Local {
                common_name: "My Test CA".to_string(),
                key_length: 2048,
            },
            ..IssuerConfig::default()
        },
    };
    certissuer::logging::init(&config.logging);

    let service = CertificateService::from_config(&config).await?;

    let request = CsrRequest::builder()
        .friendly_name("demo")
        .subject("CN=myserver.local,O=Example Corp")
        .subject_alternative_names(vec!["myserver.local".to_string(), "www.myserver.local".to_string()])
        .build();

    let csr = service.create_csr(&request).await?;
    println!("Certificate Request:\n{}", csr.certificate_request);

    let issued = service.generate_certificate(&request).await?;
    println!(
        "Issued #{} for {} (valid until {}):\n{}",
        issued.certificate_id, issued.common_name, issued.valid_until, issued.certificate_content
    );

    for certificate in service.list_certificates().await? {
        println!(
            "#{} {} expired: {}",
            certificate.certificate_id, certificate.common_name, certificate.is_expired
        );
    }

    service.delete_certificate(issued.certificate_id).await?;
    Ok(())
}
