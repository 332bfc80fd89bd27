use crate::utils::error::HealthCheckError;

/// Longest domain name DNS can represent.
pub const MAX_DOMAIN_LENGTH: usize = 253;

/// Validates the domain of a check request and returns it trimmed.
///
/// # Returns
///
/// * `Ok(domain)` with surrounding whitespace removed.
/// * `Err(HealthCheckError::Validation)` if the domain is blank, longer than
///   [`MAX_DOMAIN_LENGTH`], or contains control characters.
pub fn validate_domain(raw: &str) -> Result<&str, HealthCheckError> {
    let domain = raw.trim();

    if domain.is_empty() {
        return Err(HealthCheckError::Validation("Domain is required".into()));
    }
    if domain.chars().count() > MAX_DOMAIN_LENGTH {
        return Err(HealthCheckError::Validation(format!(
            "Domain must be at most {MAX_DOMAIN_LENGTH} characters"
        )));
    }
    if domain.chars().any(char::is_control) {
        return Err(HealthCheckError::Validation(
            "Domain contains invalid characters".into(),
        ));
    }

    Ok(domain)
}

/// Rejects inbound frames larger than `limit` bytes.
pub fn validate_size(text: &str, limit: usize) -> Result<(), HealthCheckError> {
    if text.len() > limit {
        return Err(HealthCheckError::InvalidRequest("message too long".into()));
    }
    Ok(())
}
