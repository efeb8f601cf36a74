// Property: every access mode of a Blob observes the same size and bytes,
// the sniff prefix is min(size, 512) long, and each stream is independent.

use image_relay::blob::SNIFF_LEN;
use image_relay::Blob;
use proptest::prelude::*;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Runtime;

async fn read_stream(blob: &Blob) -> (Vec<u8>, u64) {
    let (mut reader, size) = blob.new_stream().await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    (out, size)
}

async fn read_seekable(blob: &Blob) -> (Vec<u8>, u64) {
    let (mut reader, size) = blob.new_seekable_stream().await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    (out, size)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_access_modes_agree(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let blob = Blob::from_bytes(data.clone(), None);

        let (bytes, streamed, stream_size, seeked, seek_size) = tokio_test::block_on(async {
            let bytes = blob.as_bytes().await.unwrap();
            let (streamed, stream_size) = read_stream(&blob).await;
            let (seeked, seek_size) = read_seekable(&blob).await;
            (bytes, streamed, stream_size, seeked, seek_size)
        });

        prop_assert_eq!(blob.size(), data.len() as u64);
        prop_assert_eq!(&bytes[..], &data[..]);
        prop_assert_eq!(&streamed, &data);
        prop_assert_eq!(&seeked, &data);
        prop_assert_eq!(stream_size, blob.size());
        prop_assert_eq!(seek_size, blob.size());
    }

    #[test]
    fn prop_sniff_prefix_length(len in 0usize..2048) {
        let blob = Blob::from_bytes(vec![b'x'; len], None);
        prop_assert_eq!(blob.sniff_prefix().len(), len.min(SNIFF_LEN));
        prop_assert_eq!(blob.sniff_prefix(), &vec![b'x'; len.min(SNIFF_LEN)][..]);
    }

    #[test]
    fn prop_streams_are_independent(
        data in prop::collection::vec(any::<u8>(), 1..2048),
        consume in 0usize..2048,
    ) {
        let blob = Blob::from_bytes(data.clone(), None);
        let consume = consume.min(data.len());

        let (second, seek_second) = tokio_test::block_on(async {
            let (mut first, _) = blob.new_stream().await.unwrap();
            let mut partial = vec![0u8; consume];
            first.read_exact(&mut partial).await.unwrap();
            let (second, _) = read_stream(&blob).await;

            let (mut seek_first, _) = blob.new_seekable_stream().await.unwrap();
            seek_first.seek(SeekFrom::End(0)).await.unwrap();
            let (seek_second, _) = read_seekable(&blob).await;
            (second, seek_second)
        });

        prop_assert_eq!(&second, &data);
        prop_assert_eq!(&seek_second, &data);
    }
}

#[test]
fn test_file_blob_matches_memory_blob() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let from_file = Blob::from_file(&path, None).await.unwrap();
        let from_memory = Blob::from_bytes(data.clone(), None);

        assert_eq!(from_file.size(), from_memory.size());
        assert_eq!(from_file.sniff_prefix(), from_memory.sniff_prefix());
        assert_eq!(from_file.sniff_prefix().len(), SNIFF_LEN);
        assert_eq!(from_file.as_bytes().await.unwrap(), from_memory.as_bytes().await.unwrap());
        assert_eq!(read_stream(&from_file).await.0, data);
        assert_eq!(read_seekable(&from_file).await.0, data);
    });
}

#[test]
fn test_seekable_stream_seeks() {
    tokio_test::block_on(async {
        let blob = Blob::from_bytes(&b"0123456789"[..], None);
        let (mut reader, size) = blob.new_seekable_stream().await.unwrap();
        assert_eq!(size, 10);

        reader.seek(SeekFrom::Start(6)).await.unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).await.unwrap();
        assert_eq!(tail, "6789");

        reader.seek(SeekFrom::Start(0)).await.unwrap();
        let mut head = [0u8; 3];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"012");
    });
}
