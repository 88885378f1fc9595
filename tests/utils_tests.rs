use chunkferry::utils::{chunk_count, sanitize_filename};

#[test]
fn test_sanitize_filename() {
    // basic alphanumeric with extension
    assert_eq!(sanitize_filename("hello.txt"), "hello.txt");

    // directory traversal attempts
    assert_eq!(sanitize_filename("../hello.txt"), "hello.txt");
    assert_eq!(sanitize_filename("foo/bar.txt"), "foobar.txt");
    assert_eq!(sanitize_filename("/etc/passwd"), "etcpasswd");

    // special characters
    assert_eq!(sanitize_filename("hello-world_123.txt"), "hello-world_123.txt");
    assert_eq!(sanitize_filename("hello@world.txt"), "helloworld.txt");

    // leading dots
    assert_eq!(sanitize_filename(".hidden"), "hidden");
    assert_eq!(sanitize_filename("..hidden"), "hidden");

    // nothing usable left
    assert_eq!(sanitize_filename("../"), "upload");
}

#[test]
fn test_chunk_count() {
    let mib = 1024 * 1024;

    assert_eq!(chunk_count(10 * mib, mib), 10);
    assert_eq!(chunk_count(10 * mib + 1, mib), 11);
    assert_eq!(chunk_count(1, mib), 1);
    assert_eq!(chunk_count(0, mib), 0);
    assert_eq!(chunk_count(100, 0), 0);

    // ceil(size / chunk) for a spread of sizes
    for size in [1u64, 7, 255, 256, 257, 4095, 4096, 4097] {
        for chunk in [1u64, 3, 256, 4096] {
            let expected = (size + chunk - 1) / chunk;
            assert_eq!(chunk_count(size, chunk), expected, "size {} chunk {}", size, chunk);
        }
    }
}
