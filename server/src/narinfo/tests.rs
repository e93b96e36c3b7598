use super::*;

use magpie::nar_url::Compression;
use magpie::signing::{verify_first, Keypair};

const RUBY: &str = r#"StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
Compression: xz
FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
FileSize: 4029176
NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
NarSize: 18735072
References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3 a4yw1svqqk4d8lhwinn9xp847zz9gfma-bash-4.4-p23
Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
"#;

#[test]
fn test_parse() {
    let narinfo = NarInfo::from_str(RUBY).unwrap();

    assert_eq!(
        PathBuf::from("/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3"),
        narinfo.store_path
    );
    assert_eq!(
        "1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3",
        narinfo.url.hash
    );
    assert_eq!(Compression::Xz, narinfo.compression);
    assert_eq!(Some(4029176), narinfo.file_size);
    assert_eq!(18735072, narinfo.nar_size);
    assert_eq!(2, narinfo.references.len());
    assert_eq!(
        Some("bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv".to_string()),
        narinfo.deriver
    );
    assert_eq!(1, narinfo.signatures.len());

    narinfo.check().unwrap();
}

#[test]
fn test_round_trip() {
    let narinfo = NarInfo::from_str(RUBY).unwrap();
    let reparsed = NarInfo::from_str(&narinfo.to_string()).unwrap();

    assert_eq!(narinfo.store_path, reparsed.store_path);
    assert_eq!(narinfo.url, reparsed.url);
    assert_eq!(narinfo.compression, reparsed.compression);
    assert_eq!(narinfo.file_hash, reparsed.file_hash);
    assert_eq!(narinfo.file_size, reparsed.file_size);
    assert_eq!(narinfo.nar_hash, reparsed.nar_hash);
    assert_eq!(narinfo.nar_size, reparsed.nar_size);
    assert_eq!(narinfo.references, reparsed.references);
    assert_eq!(narinfo.deriver, reparsed.deriver);
    assert_eq!(narinfo.signatures, reparsed.signatures);
}

#[test]
fn test_repeated_signatures() {
    let document = format!("{RUBY}Sig: mirror-1:dGhpcyBpcyBub3QgYSByZWFsIHNpZ25hdHVyZSBidXQgaXQgaXMgNjQgYnl0ZXMgbG9uZyE=\n");
    let narinfo = NarInfo::from_str(&document).unwrap();

    assert_eq!(2, narinfo.signatures.len());

    let serialized = narinfo.to_string();
    assert_eq!(2, serialized.matches("Sig: ").count());
}

#[test]
fn test_missing_required_fields() {
    for key in ["StorePath", "URL", "NarHash", "NarSize"] {
        let document: String = RUBY
            .lines()
            .filter(|line| !line.starts_with(key))
            .map(|line| format!("{line}\n"))
            .collect();

        NarInfo::from_str(&document).unwrap_err();
    }
}

#[test]
fn test_missing_compression_follows_url() {
    let document: String = RUBY
        .lines()
        .filter(|line| !line.starts_with("Compression"))
        .map(|line| format!("{line}\n"))
        .collect();

    let narinfo = NarInfo::from_str(&document).unwrap();
    assert_eq!(Compression::Xz, narinfo.compression);
    narinfo.check().unwrap();
}

#[test]
fn test_unknown_deriver() {
    let document = RUBY.replace(
        "Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv",
        "Deriver: unknown-deriver",
    );

    let narinfo = NarInfo::from_str(&document).unwrap();
    assert_eq!(None, narinfo.deriver);
}

#[test]
fn test_check_rejects_compression_mismatch() {
    let mut narinfo = NarInfo::from_str(RUBY).unwrap();
    narinfo.compression = Compression::Zstd;
    narinfo.check().unwrap_err();
}

#[test]
fn test_check_rejects_relative_store_path() {
    let mut narinfo = NarInfo::from_str(RUBY).unwrap();
    narinfo.store_path = PathBuf::from("nix/store/foo");
    narinfo.check().unwrap_err();
}

#[test]
fn test_fingerprint() {
    let narinfo = NarInfo::from_str(RUBY).unwrap();

    let expected = "1;/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3;sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h;18735072;/nix/store/0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3,/nix/store/a4yw1svqqk4d8lhwinn9xp847zz9gfma-bash-4.4-p23";

    assert_eq!(expected.as_bytes(), narinfo.fingerprint().as_slice());
}

#[test]
fn test_sign_preserves_other_signatures() {
    let mut narinfo = NarInfo::from_str(RUBY).unwrap();
    let keypair = Keypair::generate("proxy.example.org").unwrap();

    narinfo.sign(&keypair);
    assert_eq!(2, narinfo.signatures.len());
    assert!(narinfo.signatures[0].starts_with("cache.nixos.org-1:"));
    assert!(narinfo.signatures[1].starts_with("proxy.example.org:"));

    assert!(verify_first(
        &narinfo.signatures,
        &narinfo.fingerprint(),
        &[keypair.to_public_key()],
    ));

    // re-signing replaces our signature instead of accumulating
    narinfo.sign(&keypair);
    assert_eq!(2, narinfo.signatures.len());
}
