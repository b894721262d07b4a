use crate::error::CertIssuerError;

/// Convert DER‑encoded data into a PEM‑encoded string with the provided label.
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let pem = pem::Pem::new(label, der);
    pem::encode_config(&pem, pem::EncodeConfig::new())
}

/// Convert a PEM‑encoded string to DER‑encoded bytes, accepting only the given labels.
pub fn pem_to_der(pem_str: &str, labels: &[&str]) -> Result<Vec<u8>, CertIssuerError> {
    let pem = pem::parse(pem_str)?;
    if !labels.contains(&pem.tag()) {
        return Err(CertIssuerError::CsrEncodingError(format!(
            "unexpected PEM label {:?}, expected one of {labels:?}",
            pem.tag()
        )));
    }
    Ok(pem.contents().to_vec())
}
