use anyhow::{Result, anyhow, bail};
use indicatif::ProgressStyle;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}")
        .expect("invalid progress bar template")
        .progress_chars("#>-")
}

/// 解析逗号分隔的 ef 列表，例如 `16,32,64`
pub fn parse_ef_array(s: &str) -> Result<Vec<usize>> {
    let values = s
        .split(',')
        .map(|v| {
            let v = v.trim();
            match v.parse::<usize>() {
                Ok(0) | Err(_) => Err(anyhow!("无效的 ef 值 '{}'，需要形如 \"16,32,64\" 的正整数列表", v)),
                Ok(n) => Ok(n),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(values)
}

/// 解析 `key1=value1,key2=value2` 格式的标签，空字符串表示没有标签
pub fn parse_labels(s: &str) -> Result<Vec<(String, String)>> {
    if s.trim().is_empty() {
        return Ok(vec![]);
    }
    s.split(',')
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_owned(), v.trim().to_owned())),
            _ => bail!("无效的标签 '{}'，需要 key=value 格式", pair),
        })
        .collect()
}
