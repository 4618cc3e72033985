//! 对象的 Content-Type：先按扩展名猜测，猜不到时看内容

use std::path::Path;

/// 无法识别的二进制内容
pub const OCTET_STREAM: &str = "application/octet-stream";

/// 内容嗅探只看开头这么多字节
const SNIFF_LEN: usize = 8 * 1024;

/// 根据路径和文件开头的内容推断 Content-Type
pub fn content_type_for(path: &Path, head: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(path).first() {
        return mime.essence_str().to_string();
    }
    if looks_like_text(head) {
        "text/plain".to_string()
    } else {
        OCTET_STREAM.to_string()
    }
}

/// 非空、没有 NUL、是合法 UTF-8（末尾被截断的字符不算错）
fn looks_like_text(head: &[u8]) -> bool {
    let sample = &head[..head.len().min(SNIFF_LEN)];
    if sample.is_empty() || sample.contains(&0) {
        return false;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_from_extension() {
        assert_eq!(content_type_for(Path::new("a/b.txt"), b""), "text/plain");
        assert_eq!(content_type_for(Path::new("photo.JPG"), b"\xff\xd8"), "image/jpeg");
        assert_eq!(content_type_for(Path::new("page.html"), b""), "text/html");
        assert_eq!(content_type_for(Path::new("x.json"), b"{}"), "application/json");
    }

    #[test]
    fn test_sniff_without_extension() {
        assert_eq!(content_type_for(Path::new("README"), b"hello\n"), "text/plain");
        assert_eq!(content_type_for(Path::new("Makefile"), "ünïcode".as_bytes()), "text/plain");
        assert_eq!(content_type_for(Path::new("blob"), b"\x7fELF\x02\x01\x00"), OCTET_STREAM);
        assert_eq!(content_type_for(Path::new("empty"), b""), OCTET_STREAM);

        // 嗅探窗口末尾截断的多字节字符仍算文本
        let mut text = vec![b'a'; SNIFF_LEN - 1];
        text.extend_from_slice("é".as_bytes());
        assert_eq!(content_type_for(Path::new("LOG"), &text), "text/plain");
    }
}
