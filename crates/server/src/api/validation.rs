use super::error::ApiError;
use super::types::{BatchGenerateRequest, GenerateRequest, SamplingFields};

/// Upper bound of `top_k` accepted over HTTP (the codebook size).
pub const MAX_TOP_K: usize = 4096;
pub const MAX_CFG_SCALE: f32 = 10.0;

pub fn validate_generate_request(req: &GenerateRequest) -> Result<(), ApiError> {
    validate_prompt(&req.prompt)?;
    validate_sampling(&req.sampling)
}

pub fn validate_batch_request(
    req: &BatchGenerateRequest,
    max_batch_size: usize,
) -> Result<(), ApiError> {
    if req.prompts.is_empty() {
        return Err(ApiError::InvalidRequest(
            "prompts must not be empty".to_string(),
        ));
    }
    if req.prompts.len() > max_batch_size {
        return Err(ApiError::InvalidRequest(format!(
            "Maximum {max_batch_size} prompts allowed, got {}",
            req.prompts.len()
        )));
    }
    for prompt in &req.prompts {
        validate_prompt(prompt)?;
    }
    validate_sampling(&req.sampling)
}

fn validate_prompt(prompt: &str) -> Result<(), ApiError> {
    if prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_sampling(sampling: &SamplingFields) -> Result<(), ApiError> {
    validate_cfg_scale(sampling.cfg_scale)?;
    validate_top_k(sampling.top_k)?;
    validate_top_p(sampling.top_p)
}

fn validate_cfg_scale(cfg_scale: f32) -> Result<(), ApiError> {
    if !(1.0..=MAX_CFG_SCALE).contains(&cfg_scale) {
        return Err(ApiError::InvalidRequest(format!(
            "cfg_scale must be between 1 and {MAX_CFG_SCALE}, got {cfg_scale}"
        )));
    }
    Ok(())
}

fn validate_top_k(top_k: usize) -> Result<(), ApiError> {
    if top_k > MAX_TOP_K {
        return Err(ApiError::InvalidRequest(format!(
            "top_k must be between 0 and {MAX_TOP_K}, got {top_k}"
        )));
    }
    Ok(())
}

fn validate_top_p(top_p: f32) -> Result<(), ApiError> {
    if !(0.0..=1.0).contains(&top_p) {
        return Err(ApiError::InvalidRequest(format!(
            "top_p must be between 0 and 1, got {top_p}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(prompt: &str, sampling: SamplingFields) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            sampling,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_generate_request(&single("a rose", SamplingFields::default())).is_ok());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let edge = SamplingFields {
            cfg_scale: 10.0,
            top_k: 4096,
            top_p: 1.0,
            seed: None,
        };
        assert!(validate_sampling(&edge).is_ok());
        let low = SamplingFields {
            cfg_scale: 1.0,
            top_k: 0,
            top_p: 0.0,
            seed: Some(0),
        };
        assert!(validate_sampling(&low).is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let base = SamplingFields::default();
        for bad in [
            SamplingFields { cfg_scale: 0.5, ..base },
            SamplingFields { cfg_scale: 10.5, ..base },
            SamplingFields { cfg_scale: f32::NAN, ..base },
            SamplingFields { top_k: 4097, ..base },
            SamplingFields { top_p: -0.1, ..base },
            SamplingFields { top_p: 1.01, ..base },
        ] {
            assert!(
                matches!(validate_sampling(&bad), Err(ApiError::InvalidRequest(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn blank_prompt_is_rejected() {
        assert!(validate_generate_request(&single("   ", SamplingFields::default())).is_err());
    }

    #[test]
    fn batch_limits() {
        let req = |n: usize| BatchGenerateRequest {
            prompts: vec!["p".to_string(); n],
            sampling: SamplingFields::default(),
        };
        assert!(validate_batch_request(&req(8), 8).is_ok());
        assert!(validate_batch_request(&req(9), 8).is_err());
        assert!(validate_batch_request(&req(0), 8).is_err());
    }
}
