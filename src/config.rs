use std::path::PathBuf;
use std::time::Duration;

/// 身份服务（匿名账号、刷新令牌）相关配置
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key: String,
    pub signup_url: String,
    pub lookup_url: String,
    pub refresh_url: String,
    pub user_agent: String,
    // None 表示凭据只保存在内存中
    pub token_file: Option<PathBuf>,
    // 在真正过期前多久就视为过期
    pub refresh_margin: Duration,
    // 本地判断有效后，是否再向服务端确认一次
    pub verify_remote: bool,
}

/// 语音会话（WebSocket）相关配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_url: String,
    pub origin: String,
    pub user_agent: String,
    pub client_name: String,
    pub character: String,
    pub timezone: String,
    pub language: String,
    pub client_sample_rate: u32,
    // 握手应答未带采样率时使用
    pub default_server_sample_rate: u32,
    pub connect_timeout: Duration,
    pub audio_queue_capacity: usize,
}

/// 调用方音频参数（麦克风帧大小和静音门限）
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub frame_samples: usize,
    pub amplitude_threshold: f32,
    pub silence_limit: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            auth: AuthConfig::from_build_env()?,
            session: SessionConfig::from_build_env()?,
            audio: AudioConfig::from_build_env()?,
        })
    }
}

impl AuthConfig {
    pub fn from_build_env() -> Result<Self, &'static str> {
        let token_file = env!("AUTH_TOKEN_FILE");
        Ok(Self {
            api_key: env!("AUTH_API_KEY").to_string(),
            signup_url: env!("AUTH_SIGNUP_URL").to_string(),
            lookup_url: env!("AUTH_LOOKUP_URL").to_string(),
            refresh_url: env!("AUTH_REFRESH_URL").to_string(),
            user_agent: env!("AUTH_USER_AGENT").to_string(),
            token_file: if token_file.is_empty() {
                None
            } else {
                Some(PathBuf::from(token_file))
            },
            refresh_margin: Duration::from_secs(
                env!("AUTH_REFRESH_MARGIN_SECS")
                    .parse()
                    .map_err(|_| "Failed to parse AUTH_REFRESH_MARGIN_SECS")?,
            ),
            verify_remote: env!("AUTH_VERIFY_REMOTE")
                .parse()
                .map_err(|_| "Failed to parse AUTH_VERIFY_REMOTE")?,
        })
    }
}

impl SessionConfig {
    pub fn from_build_env() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("SESSION_WS_URL").to_string(),
            origin: env!("SESSION_ORIGIN").to_string(),
            user_agent: env!("SESSION_USER_AGENT").to_string(),
            client_name: env!("SESSION_CLIENT_NAME").to_string(),
            character: env!("SESSION_CHARACTER").to_string(),
            timezone: env!("SESSION_TIMEZONE").to_string(),
            language: env!("SESSION_LANGUAGE").to_string(),
            client_sample_rate: env!("SESSION_CLIENT_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse SESSION_CLIENT_SAMPLE_RATE")?,
            default_server_sample_rate: env!("SESSION_DEFAULT_SERVER_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse SESSION_DEFAULT_SERVER_SAMPLE_RATE")?,
            connect_timeout: Duration::from_secs(
                env!("SESSION_CONNECT_TIMEOUT_SECS")
                    .parse()
                    .map_err(|_| "Failed to parse SESSION_CONNECT_TIMEOUT_SECS")?,
            ),
            audio_queue_capacity: env!("SESSION_AUDIO_QUEUE_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse SESSION_AUDIO_QUEUE_CAPACITY")?,
        })
    }
}

impl AudioConfig {
    pub fn from_build_env() -> Result<Self, &'static str> {
        Ok(Self {
            frame_samples: env!("AUDIO_FRAME_SAMPLES")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_FRAME_SAMPLES")?,
            amplitude_threshold: env!("AUDIO_AMPLITUDE_THRESHOLD")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_AMPLITUDE_THRESHOLD")?,
            silence_limit: env!("AUDIO_SILENCE_LIMIT")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_SILENCE_LIMIT")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::from_build_env().expect("Failed to create AuthConfig from build-time environment variables")
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_build_env()
            .expect("Failed to create SessionConfig from build-time environment variables")
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::from_build_env().expect("Failed to create AudioConfig from build-time environment variables")
    }
}
