use crate::config::types::{
    BatchConfig, Config, CrawlerConfig, DetectionConfig, DownloaderConfig, PathsConfig,
};
use crate::ConfigError;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_paths(&config.paths)?;
    validate_detection(&config.detection)?;
    validate_crawler(&config.crawler)?;
    validate_downloader(&config.downloader)?;
    validate_batch(&config.batch)?;
    Ok(())
}

fn validate_paths(paths: &PathsConfig) -> Result<(), ConfigError> {
    for (name, path) in [
        ("database-folder", &paths.database_folder),
        ("image-folder", &paths.image_folder),
        ("cropped-face-folder", &paths.cropped_face_folder),
        ("download-folder", &paths.download_folder),
        ("state-file", &paths.state_file),
        ("history-database", &paths.history_database),
    ] {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }
    Ok(())
}

fn validate_detection(config: &DetectionConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&config.detection_threshold) {
        return Err(ConfigError::Validation(format!(
            "detection-threshold must be between 0 and 1, got {}",
            config.detection_threshold
        )));
    }

    if config.min_face_size < 0.0 {
        return Err(ConfigError::Validation(format!(
            "min-face-size cannot be negative, got {}",
            config.min_face_size
        )));
    }

    if config.extractor_command.iter().any(|arg| arg.is_empty()) {
        return Err(ConfigError::Validation(
            "extractor-command cannot contain empty arguments".to_string(),
        ));
    }

    if config.extract_timeout_secs == 0 || config.extract_timeout_secs > 3600 {
        return Err(ConfigError::Validation(format!(
            "extract-timeout-secs must be between 1 and 3600, got {}",
            config.extract_timeout_secs
        )));
    }

    Ok(())
}

fn validate_crawler(config: &CrawlerConfig) -> Result<(), ConfigError> {
    validate_user_agent(&config.user_agent)?;

    if config.request_delay_ms > 60_000 {
        return Err(ConfigError::Validation(format!(
            "request-delay-ms must be <= 60000, got {}",
            config.request_delay_ms
        )));
    }

    validate_retries("max-retries", config.max_retries)?;
    validate_timeout("crawler timeout-secs", config.timeout_secs)?;

    if config.checkpoint_every < 1 {
        return Err(ConfigError::Validation(
            "checkpoint-every must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_downloader(config: &DownloaderConfig) -> Result<(), ConfigError> {
    if config.concurrent_downloads < 1 || config.concurrent_downloads > 100 {
        return Err(ConfigError::Validation(format!(
            "concurrent-downloads must be between 1 and 100, got {}",
            config.concurrent_downloads
        )));
    }

    validate_retries("retry-count", config.retry_count)?;
    validate_timeout("downloader timeout-secs", config.timeout_secs)?;

    if let Some(user_agent) = &config.user_agent {
        validate_user_agent(user_agent)?;
    }

    Ok(())
}

fn validate_batch(config: &BatchConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be >= 1, got {}",
            config.batch_size
        )));
    }

    if config.processing_workers < 1 || config.processing_workers > 64 {
        return Err(ConfigError::Validation(format!(
            "processing-workers must be between 1 and 64, got {}",
            config.processing_workers
        )));
    }

    Ok(())
}

fn validate_user_agent(user_agent: &str) -> Result<(), ConfigError> {
    if user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if user_agent.chars().any(|c| c.is_control()) {
        return Err(ConfigError::Validation(
            "user-agent cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_retries(name: &str, retries: u32) -> Result<(), ConfigError> {
    if retries > 10 {
        return Err(ConfigError::Validation(format!(
            "{} must be <= 10, got {}",
            name, retries
        )));
    }
    Ok(())
}

fn validate_timeout(name: &str, secs: u64) -> Result<(), ConfigError> {
    if secs < 1 || secs > 300 {
        return Err(ConfigError::Validation(format!(
            "{} must be between 1 and 300, got {}",
            name, secs
        )));
    }
    Ok(())
}
