use super::TorrentMeta;

impl TorrentMeta {
    /// `magnet:?xt=urn:btih:<hex>&dn=<name>&tr=<tracker>...` for this torrent.
    /// Trackers from `announce` and every tier are listed once, in order.
    pub fn magnet_link(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash_hex());
        uri.push_str(&format!("&dn={}", url_encode(&self.name)));

        let mut trackers: Vec<&str> = Vec::new();
        let tiers = self.announce_list.iter().flatten().map(String::as_str);
        for tracker in self.announce.as_deref().into_iter().chain(tiers) {
            if !trackers.contains(&tracker) {
                trackers.push(tracker);
            }
        }
        for tracker in trackers {
            uri.push_str(&format!("&tr={}", url_encode(tracker)));
        }
        uri
    }
}

fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileInfo;

    #[test]
    fn test_magnet_link() {
        let files = vec![FileInfo { path: vec!["my file.iso".into()], length: 100 }];
        let mut meta =
            TorrentMeta::new("my file.iso".into(), 16_384, files, vec![[0; 20]], [0xAB; 20]).unwrap();
        meta.announce = Some("http://t.example/announce".into());
        meta.announce_list = vec![
            vec!["http://t.example/announce".into()],
            vec!["udp://backup.example:80".into()],
        ];

        assert_eq!(
            meta.magnet_link(),
            format!(
                "magnet:?xt=urn:btih:{}&dn=my%20file.iso\
                 &tr=http%3A%2F%2Ft.example%2Fannounce\
                 &tr=udp%3A%2F%2Fbackup.example%3A80",
                "ab".repeat(20)
            )
        );
    }

    #[test]
    fn test_magnet_link_without_trackers() {
        let files = vec![FileInfo { path: vec!["a".into()], length: 1 }];
        let meta = TorrentMeta::new("a".into(), 16_384, files, vec![[0; 20]], [0; 20]).unwrap();
        assert_eq!(
            meta.magnet_link(),
            format!("magnet:?xt=urn:btih:{}&dn=a", "00".repeat(20))
        );
    }
}
