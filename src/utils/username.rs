//! 用户名校验规则与个人主页深链解析

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 30;

/// 保留用户名，注册和改名时不区分大小写拒绝
const RESERVED_USERNAMES: &[&str] = &[
    "admin",
    "administrator",
    "root",
    "support",
    "help",
    "api",
    "about",
    "settings",
    "profile",
    "system",
    "moderator",
    "cardlink",
    "official",
    "null",
    "undefined",
];

const PROFILE_LINK_PREFIX: &str = "app://profile/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameError {
    TooShort,
    TooLong,
    InvalidCharacter,
    InvalidBoundaryCharacter,
    ConsecutiveSpecialCharacters,
    Reserved,
}

impl UsernameError {
    /// 每种校验失败对应的提示，前端按原样展示
    pub fn message(&self) -> &'static str {
        match self {
            UsernameError::TooShort => "用户名至少需要3个字符",
            UsernameError::TooLong => "用户名最多30个字符",
            UsernameError::InvalidCharacter => "用户名只允许使用小写字母、数字、点和下划线",
            UsernameError::InvalidBoundaryCharacter => "用户名不能以点或下划线开头或结尾",
            UsernameError::ConsecutiveSpecialCharacters => "用户名不能包含连续的点或下划线",
            UsernameError::Reserved => "该用户名为保留名称，不能使用",
        }
    }
}

fn is_special(c: char) -> bool {
    c == '.' || c == '_'
}

pub fn validate_username(username: &str) -> Result<(), UsernameError> {
    let len = username.chars().count();
    if len < USERNAME_MIN_LEN {
        return Err(UsernameError::TooShort);
    }
    if len > USERNAME_MAX_LEN {
        return Err(UsernameError::TooLong);
    }

    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || is_special(c))
    {
        return Err(UsernameError::InvalidCharacter);
    }

    let first = username.chars().next().expect("non-empty");
    let last = username.chars().last().expect("non-empty");
    if is_special(first) || is_special(last) {
        return Err(UsernameError::InvalidBoundaryCharacter);
    }

    // 禁止 ".."、"__"、"._"、"_." 等连续特殊字符
    let chars: Vec<char> = username.chars().collect();
    if chars.windows(2).any(|w| is_special(w[0]) && is_special(w[1])) {
        return Err(UsernameError::ConsecutiveSpecialCharacters);
    }

    if RESERVED_USERNAMES.contains(&username.to_lowercase().as_str()) {
        return Err(UsernameError::Reserved);
    }

    Ok(())
}

/// 解析 `app://profile/{username}` 形式的深链，返回其中的用户名
pub fn parse_profile_link(link: &str) -> Option<&str> {
    let rest = link.strip_prefix(PROFILE_LINK_PREFIX)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}
