use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    auth: Auth,
    session: Session,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Auth {
    api_key: String,
    signup_url: String,
    lookup_url: String,
    refresh_url: String,
    token_file: String,
    refresh_margin_secs: u64,
    verify_remote: bool,
    user_agent: String,
}

#[derive(Deserialize)]
struct Session {
    ws_url: String,
    origin: String,
    user_agent: String,
    client_name: String,
    character: String,
    timezone: String,
    language: String,
    client_sample_rate: u32,
    default_server_sample_rate: u32,
    connect_timeout_secs: u64,
    audio_queue_capacity: usize,
}

#[derive(Deserialize)]
struct Audio {
    frame_samples: usize,
    amplitude_threshold: f32,
    silence_limit: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 身份服务配置
    println!("cargo:rustc-env=AUTH_API_KEY={}", config.auth.api_key);
    println!("cargo:rustc-env=AUTH_SIGNUP_URL={}", config.auth.signup_url);
    println!("cargo:rustc-env=AUTH_LOOKUP_URL={}", config.auth.lookup_url);
    println!("cargo:rustc-env=AUTH_REFRESH_URL={}", config.auth.refresh_url);
    println!("cargo:rustc-env=AUTH_TOKEN_FILE={}", config.auth.token_file);
    println!("cargo:rustc-env=AUTH_REFRESH_MARGIN_SECS={}", config.auth.refresh_margin_secs);
    println!("cargo:rustc-env=AUTH_VERIFY_REMOTE={}", config.auth.verify_remote);
    println!("cargo:rustc-env=AUTH_USER_AGENT={}", config.auth.user_agent);

    // 语音会话配置
    println!("cargo:rustc-env=SESSION_WS_URL={}", config.session.ws_url);
    println!("cargo:rustc-env=SESSION_ORIGIN={}", config.session.origin);
    println!("cargo:rustc-env=SESSION_USER_AGENT={}", config.session.user_agent);
    println!("cargo:rustc-env=SESSION_CLIENT_NAME={}", config.session.client_name);
    println!("cargo:rustc-env=SESSION_CHARACTER={}", config.session.character);
    println!("cargo:rustc-env=SESSION_TIMEZONE={}", config.session.timezone);
    println!("cargo:rustc-env=SESSION_LANGUAGE={}", config.session.language);
    println!("cargo:rustc-env=SESSION_CLIENT_SAMPLE_RATE={}", config.session.client_sample_rate);
    println!(
        "cargo:rustc-env=SESSION_DEFAULT_SERVER_SAMPLE_RATE={}",
        config.session.default_server_sample_rate
    );
    println!("cargo:rustc-env=SESSION_CONNECT_TIMEOUT_SECS={}", config.session.connect_timeout_secs);
    println!("cargo:rustc-env=SESSION_AUDIO_QUEUE_CAPACITY={}", config.session.audio_queue_capacity);

    // 音频参数
    println!("cargo:rustc-env=AUDIO_FRAME_SAMPLES={}", config.audio.frame_samples);
    println!("cargo:rustc-env=AUDIO_AMPLITUDE_THRESHOLD={}", config.audio.amplitude_threshold);
    println!("cargo:rustc-env=AUDIO_SILENCE_LIMIT={}", config.audio.silence_limit);
}
