use crate::utils::error::{FogError, Result};
use std::net::{IpAddr, SocketAddr};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// 解析 --server 參數 (IP:PORT)
pub fn validate_server(field_name: &str, server: &str) -> Result<SocketAddr> {
    let invalid = |reason: &str| FogError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: server.to_string(),
        reason: reason.to_string(),
    };

    let (ip, port) = server
        .rsplit_once(':')
        .ok_or_else(|| invalid("format must be IP:PORT (e.g. 127.0.0.1:8080)"))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| invalid("format must be IP:PORT (e.g. 127.0.0.1:8080)"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| invalid("port must be a number between 0 and 65535"))?;
    Ok(SocketAddr::new(ip, port))
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<Url> {
    if url_str.is_empty() {
        return Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(FogError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: url_str.to_string(),
                reason: format!("Unsupported URL scheme: {}", scheme),
            }),
        },
        Err(e) => Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

pub fn validate_hex(field_name: &str, value: &str) -> Result<()> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "must be hexadecimal".to_string(),
        });
    }
    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(FogError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}
