//! Assembling the canonical pipeline from configuration.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bastion_auth::{JwtConfig, JwtKey, JwtVerifier, RbacStore};
use bastion_config::{BastionConfig, JwtSection, RateLimitKey, RouteRule, SamplingConfig, SamplingStrategy};
use bastion_control::{
    BreakerConfig, BreakerRegistry, BucketConfig, BucketRegistry, CircuitState, FeatureFlags, Sampler,
};
use bastion_middleware::stages::{
    recovery::install_panic_hook, AuthenticateMiddleware, AuthorizeMiddleware,
    CircuitBreakerMiddleware, CorsMiddleware, FeatureGateMiddleware, RateLimitMiddleware,
    RecoveryMiddleware, Requirement, SamplingMiddleware, TimeoutMiddleware, TracingMiddleware,
};
use bastion_middleware::{Pipeline, SkipPaths};
use http::{HeaderName, Method};
use tokio::task::JoinHandle;

use crate::StackError;

/// A configured pipeline together with the shared state its stages use.
///
/// Disabled stages are left out of the pipeline; the remaining ones keep
/// their canonical order. Every stage honours its section's `skip_paths`.
/// Dropping the stack stops the bucket evictor.
#[derive(Debug)]
pub struct GovernanceStack {
    pipeline: Pipeline,
    breakers: Option<Arc<BreakerRegistry>>,
    buckets: Option<Arc<BucketRegistry>>,
    features: Option<Arc<FeatureFlags>>,
    verifier: Option<Arc<JwtVerifier>>,
    rbac: Arc<RbacStore>,
    evictor: Option<JoinHandle<()>>,
}

impl GovernanceStack {
    /// Builds a stack. The RBAC store is seeded with the default policy
    /// when `authorization.default_policy` is set.
    pub fn from_config(config: &BastionConfig) -> Result<Self, StackError> {
        let store = if config.authorization.default_policy {
            RbacStore::with_default_policy()
        } else {
            RbacStore::new()
        };
        Self::with_store(config, Arc::new(store))
    }

    /// Builds a stack around a caller-provided RBAC store.
    pub fn with_store(config: &BastionConfig, rbac: Arc<RbacStore>) -> Result<Self, StackError> {
        config.validate()?;

        let mut builder = Pipeline::builder().add_stage_skipping(
            RecoveryMiddleware::new()
                .capture_stack(config.recovery.capture_stack)
                .max_stack_bytes(config.recovery.max_stack_bytes),
            SkipPaths::new(&config.recovery.skip_paths),
        );
        if config.recovery.capture_stack {
            install_panic_hook();
        }

        let sampler = Arc::new(build_sampler(&config.sampling)?);
        builder = builder.add_stage_skipping(
            SamplingMiddleware::new(sampler).emit_header(config.sampling.emit_header),
            SkipPaths::new(&config.sampling.skip_paths),
        );

        if config.tracing.enabled {
            builder = builder.add_stage_skipping(
                TracingMiddleware::new(config.service.name.clone(), config.service.version.clone()),
                SkipPaths::new(&config.tracing.skip_paths),
            );
        }

        if config.cors.enabled {
            builder = builder.add_stage_skipping(build_cors(config)?, SkipPaths::new(&config.cors.skip_paths));
        }

        let mut features = None;
        if config.features.enabled {
            let flags = Arc::new(FeatureFlags::new());
            for flag in &config.features.flags {
                flags.register(flag.name.clone(), flag.description.clone(), flag.enabled);
            }
            let stage = config
                .features
                .gates
                .iter()
                .fold(FeatureGateMiddleware::new(Arc::clone(&flags)), |stage, gate| {
                    stage.gate(gate.path.clone(), gate.flag.clone())
                });
            builder = builder.add_stage_skipping(stage, SkipPaths::new(&config.features.skip_paths));
            features = Some(flags);
        }

        let mut buckets = None;
        let mut evictor = None;
        if config.rate_limit.enabled {
            let limit = &config.rate_limit;
            let registry = Arc::new(BucketRegistry::new(BucketConfig::from_rate(
                limit.requests_per_second,
                limit.burst,
                limit.window(),
            )));
            let stage = RateLimitMiddleware::new(Arc::clone(&registry));
            let stage = match limit.key {
                RateLimitKey::ClientIp => stage,
                RateLimitKey::Global => stage.global(),
                RateLimitKey::User => stage.per_user(),
                RateLimitKey::Header => {
                    let raw = limit.key_header.as_deref().unwrap_or_default();
                    let name = HeaderName::try_from(raw)
                        .map_err(|_| StackError::invalid_http("rate_limit.key_header", raw))?;
                    stage.per_header(name)
                }
            };
            builder = builder.add_stage_skipping(stage, SkipPaths::new(&limit.skip_paths));

            if let Some(max_idle) = limit.idle_eviction() {
                if tokio::runtime::Handle::try_current().is_ok() {
                    evictor = Some(registry.spawn_evictor(max_idle / 2, max_idle));
                } else {
                    tracing::debug!("no Tokio runtime, idle bucket eviction disabled");
                }
            }
            buckets = Some(registry);
        }

        let mut breakers = None;
        if config.circuit_breaker.enabled {
            let breaker = &config.circuit_breaker;
            let registry = Arc::new(BreakerRegistry::new(BreakerConfig {
                failure_threshold: breaker.failure_threshold,
                success_threshold: breaker.success_threshold,
                timeout: breaker.timeout(),
                timeout_window: breaker.timeout_window(),
            }));
            builder = builder.add_stage_skipping(
                CircuitBreakerMiddleware::new(Arc::clone(&registry), &breaker.name),
                SkipPaths::new(&breaker.skip_paths),
            );
            breakers = Some(registry);
        }

        let public = SkipPaths::new(&config.jwt.skip_paths);
        let unguarded = SkipPaths::new(
            config
                .jwt
                .skip_paths
                .iter()
                .chain(&config.authorization.skip_paths),
        );

        let mut verifier = None;
        if config.jwt.enabled {
            let jwt = Arc::new(build_verifier(&config.jwt)?);
            let stage = AuthenticateMiddleware::new(Arc::clone(&jwt))
                .optional_paths(SkipPaths::new(&config.jwt.optional_paths));
            builder = builder.add_stage_skipping(stage, public);
            verifier = Some(jwt);
        }

        if config.authorization.enabled {
            let mut stage = AuthorizeMiddleware::new(Arc::clone(&rbac));
            for rule in &config.authorization.routes {
                let method = rule
                    .method
                    .as_deref()
                    .map(|m| {
                        Method::from_bytes(m.as_bytes())
                            .map_err(|_| StackError::invalid_http("authorization.routes.method", m))
                    })
                    .transpose()?;
                stage = stage.route(method, rule.path.clone(), requirement(rule));
            }
            builder = builder.add_stage_skipping(stage, unguarded);
        }

        if config.timeout.enabled {
            builder = builder.add_stage_skipping(
                TimeoutMiddleware::new(config.timeout.timeout()),
                SkipPaths::new(&config.timeout.skip_paths),
            );
        }

        let pipeline = builder.build();
        tracing::info!(
            service = %config.service.name,
            stages = ?pipeline.stage_names(),
            "governance stack assembled"
        );

        Ok(Self {
            pipeline,
            breakers,
            buckets,
            features,
            verifier,
            rbac,
            evictor,
        })
    }

    /// The assembled pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Breaker registry, when the breaker stage is enabled.
    pub fn breakers(&self) -> Option<&Arc<BreakerRegistry>> {
        self.breakers.as_ref()
    }

    /// Bucket registry, when the rate-limit stage is enabled.
    pub fn buckets(&self) -> Option<&Arc<BucketRegistry>> {
        self.buckets.as_ref()
    }

    /// Feature-flag table, when the feature gate is enabled.
    pub fn features(&self) -> Option<&Arc<FeatureFlags>> {
        self.features.as_ref()
    }

    /// JWT verifier, when authentication is enabled. Also issues tokens.
    pub fn verifier(&self) -> Option<&Arc<JwtVerifier>> {
        self.verifier.as_ref()
    }

    /// RBAC store used by the Authorize stage.
    pub fn rbac(&self) -> &Arc<RbacStore> {
        &self.rbac
    }

    /// Breaker names and states, for health reporting.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .as_ref()
            .map(|registry| registry.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for GovernanceStack {
    fn drop(&mut self) {
        if let Some(handle) = self.evictor.take() {
            handle.abort();
        }
    }
}

fn build_sampler(config: &SamplingConfig) -> Result<Sampler, StackError> {
    let sampler = match config.strategy {
        SamplingStrategy::Always => Sampler::Always,
        SamplingStrategy::Never => Sampler::Never,
        SamplingStrategy::Probabilistic => Sampler::probabilistic(config.rate)?,
        SamplingStrategy::RateLimiting => Sampler::rate_limiting(config.max_per_second)?,
        SamplingStrategy::Adaptive => {
            Sampler::adaptive(config.rate, config.min_rate, config.max_rate)?
        }
    };
    Ok(sampler)
}

fn build_cors(config: &BastionConfig) -> Result<CorsMiddleware, StackError> {
    let cors = &config.cors;
    let methods = cors
        .allowed_methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.as_bytes()).map_err(|_| StackError::invalid_http("cors.allowed_methods", m))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let builder = CorsMiddleware::builder()
        .allow_origins(cors.allowed_origins.iter().cloned())
        .allow_methods(methods)
        .allow_headers(cors.allowed_headers.iter().cloned())
        .expose_headers(cors.exposed_headers.iter().cloned())
        .allow_credentials(cors.allow_credentials);
    let builder = match cors.max_age_secs {
        Some(secs) => builder.max_age(std::time::Duration::from_secs(secs)),
        None => builder.no_max_age(),
    };
    Ok(builder.build()?)
}

fn build_verifier(section: &JwtSection) -> Result<JwtVerifier, StackError> {
    let config = JwtConfig {
        issuer: section.issuer.clone(),
        audience: section.audience.clone(),
        algorithm: section.algorithm,
        access_ttl_secs: section.access_ttl_secs,
        refresh_ttl_secs: section.refresh_ttl_secs,
        leeway_secs: section.leeway_secs,
    };

    let key = if section.algorithm.is_hmac() {
        JwtKey::hmac(section.secret.as_deref().unwrap_or_default())
    } else {
        let public_path = section.public_key_path.as_deref().ok_or_else(|| {
            bastion_config::ConfigError::invalid_value("jwt.public_key_path", "required for RSA")
        })?;
        let public = read_key(public_path)?;
        match section.private_key_path.as_deref() {
            Some(private_path) => JwtKey::rsa(read_key(private_path)?, public),
            None => JwtKey::rsa_public(public),
        }
    };

    Ok(JwtVerifier::new(config, key)?)
}

fn read_key(path: &Path) -> Result<Vec<u8>, StackError> {
    fs::read(path).map_err(|source| StackError::KeyFile {
        path: path.to_path_buf(),
        source,
    })
}

fn requirement(rule: &RouteRule) -> Requirement {
    if let Some((resource, action)) = rule.permission_parts() {
        Requirement::permission(resource, action)
    } else if !rule.all_roles.is_empty() {
        Requirement::all_roles(rule.all_roles.iter().cloned())
    } else {
        Requirement::any_role(rule.any_roles.iter().cloned())
    }
}
