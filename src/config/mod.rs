mod settings;

pub use settings::{
    CircuitBreakerSettings, OtelConfig, PushConfig, RabbitMqConfig, RateLimitConfig, RedisConfig,
    RetrySettings, ServerConfig, Settings, TemplateConfig,
};
