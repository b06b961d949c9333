//! nginx 配置模型
//!
//! 只解析校验需要的部分：指令、`server` 块、注释和大括号配对。
//! 不做语义解析，语法的最终判断交给 `nginx -t`。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// 候选配置：渲染器产出的配置文件集合（文件名 -> 内容）及可选镜像
#[derive(Clone, Debug)]
pub struct CandidateConfig {
    pub files: BTreeMap<String, String>,
    pub image: Option<String>,
    pub checksum: String,
}

impl CandidateConfig {
    pub fn new(files: BTreeMap<String, String>, image: Option<String>) -> Self {
        let checksum = checksum_files(&files, image.as_deref());
        Self {
            files,
            image,
            checksum,
        }
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// 对排序后的文件集合计算 SHA-256
pub fn checksum_files(files: &BTreeMap<String, String>, image: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for (name, content) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    if let Some(image) = image {
        hasher.update(b"image:");
        hasher.update(image.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// 指令
#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub line: usize,
}

impl Directive {
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

/// `server` 块（仅包含直接子指令，不含 location 内部）
#[derive(Clone, Debug)]
pub struct ServerBlock {
    pub file: String,
    pub line: usize,
    pub directives: Vec<Directive>,
}

impl ServerBlock {
    pub fn server_names(&self) -> Vec<&str> {
        self.directives
            .iter()
            .filter(|d| d.name == "server_name")
            .flat_map(|d| d.args.iter().map(String::as_str))
            .collect()
    }

    pub fn primary_domain(&self) -> Option<&str> {
        self.server_names().into_iter().next()
    }

    pub fn listens(&self) -> impl Iterator<Item = &Directive> {
        self.directives.iter().filter(|d| d.name == "listen")
    }

    /// 对外可达的虚拟主机：有 TLS 监听且有真实域名
    pub fn is_public(&self) -> bool {
        let has_tls = self.listens().any(|d| d.has_arg("ssl"));
        let has_real_name = self
            .server_names()
            .iter()
            .any(|n| !matches!(*n, "_" | "localhost" | "\"\"" | ""));
        has_tls && has_real_name
    }

    /// 是否有 HTTP/3 (QUIC) 监听
    pub fn has_http3(&self) -> bool {
        self.listens().any(|d| d.has_arg("quic"))
    }

    /// 引用的证书路径 (directive line, path)
    pub fn certificate_paths(&self) -> Vec<(usize, &str)> {
        self.directives
            .iter()
            .filter(|d| d.name == "ssl_certificate" || d.name == "ssl_certificate_key")
            .filter_map(|d| d.args.first().map(|p| (d.line, p.as_str())))
            .collect()
    }

    pub fn location(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// 单个文件的解析结果
#[derive(Clone, Debug)]
pub struct ParsedConfig {
    pub file: String,
    /// 文件内全部指令（任意嵌套层级）
    pub directives: Vec<Directive>,
    pub servers: Vec<ServerBlock>,
}

impl ParsedConfig {
    /// 带 `reuseport` 的 listen 指令位置
    pub fn reuseport_locations(&self) -> Vec<String> {
        self.directives
            .iter()
            .filter(|d| d.name == "listen" && d.has_arg("reuseport"))
            .map(|d| format!("{}:{}", self.file, d.line))
            .collect()
    }
}

/// 解析错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

enum Token {
    Word(String, usize),
    Semi(usize),
    Open(usize),
    Close(usize),
}

fn tokenize(content: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut word = String::new();
    let mut word_line = 1;
    let mut quote: Option<char> = None;
    let mut in_comment = false;

    let flush = |word: &mut String, tokens: &mut Vec<Token>, at: usize| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word), at));
        }
    };

    for c in content.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
                line += 1;
            }
            continue;
        }
        if let Some(q) = quote {
            word.push(c);
            if c == q {
                quote = None;
            }
            if c == '\n' {
                line += 1;
            }
            continue;
        }
        match c {
            '#' => {
                flush(&mut word, &mut tokens, word_line);
                in_comment = true;
            }
            '"' | '\'' => {
                if word.is_empty() {
                    word_line = line;
                }
                word.push(c);
                quote = Some(c);
            }
            ';' => {
                flush(&mut word, &mut tokens, word_line);
                tokens.push(Token::Semi(line));
            }
            '{' => {
                flush(&mut word, &mut tokens, word_line);
                tokens.push(Token::Open(line));
            }
            '}' => {
                flush(&mut word, &mut tokens, word_line);
                tokens.push(Token::Close(line));
            }
            c if c.is_whitespace() => {
                flush(&mut word, &mut tokens, word_line);
                if c == '\n' {
                    line += 1;
                }
            }
            c => {
                if word.is_empty() {
                    word_line = line;
                }
                word.push(c);
            }
        }
    }
    flush(&mut word, &mut tokens, word_line);
    tokens
}

struct Frame {
    name: String,
    line: usize,
    directives: Vec<Directive>,
}

/// 解析单个配置文件
pub fn parse(file: &str, content: &str) -> Result<ParsedConfig, ParseError> {
    let err = |line: usize, message: &str| ParseError {
        file: file.to_string(),
        line,
        message: message.to_string(),
    };

    let mut directives = Vec::new();
    let mut servers = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut words: Vec<(String, usize)> = Vec::new();

    for token in tokenize(content) {
        match token {
            Token::Word(w, line) => words.push((w, line)),
            Token::Semi(line) => {
                let mut iter = std::mem::take(&mut words).into_iter();
                let Some((name, name_line)) = iter.next() else {
                    return Err(err(line, "unexpected ';'"));
                };
                let directive = Directive {
                    name,
                    args: iter.map(|(w, _)| w).collect(),
                    line: name_line,
                };
                if let Some(frame) = stack.last_mut() {
                    frame.directives.push(directive.clone());
                }
                directives.push(directive);
            }
            Token::Open(line) => {
                let (name, name_line) = words
                    .first()
                    .cloned()
                    .unwrap_or_else(|| (String::new(), line));
                words.clear();
                stack.push(Frame {
                    name,
                    line: name_line,
                    directives: Vec::new(),
                });
            }
            Token::Close(line) => {
                if let Some((w, wl)) = words.first() {
                    return Err(err(*wl, &format!("directive '{}' is not terminated by ';'", w)));
                }
                let frame = stack.pop().ok_or_else(|| err(line, "unexpected '}'"))?;
                if frame.name == "server" {
                    servers.push(ServerBlock {
                        file: file.to_string(),
                        line: frame.line,
                        directives: frame.directives,
                    });
                }
            }
        }
    }

    if let Some((w, wl)) = words.first() {
        return Err(err(*wl, &format!("directive '{}' is not terminated by ';'", w)));
    }
    if let Some(frame) = stack.last() {
        return Err(err(frame.line, &format!("block '{}' is not closed", frame.name)));
    }

    Ok(ParsedConfig {
        file: file.to_string(),
        directives,
        servers,
    })
}

/// 校验规则
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    Syntax,
    ReuseportCount,
    MissingHttp3,
    MissingCertificate,
    InvalidCertificate,
    ConfigTest,
}

/// 违反的平台约束
#[derive(Clone, Debug, Serialize)]
pub struct Violation {
    pub rule: ViolationRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(rule: ViolationRule, location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "[{:?}] {}: {}", self.rule, loc, self.message),
            None => write!(f, "[{:?}] {}", self.rule, self.message),
        }
    }
}
