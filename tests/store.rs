use simplenpz::{
    ArrayOrder, Container, ContainerOptions, LocalBackend, Loaded, NpyArray, NpzError,
    StorageBackend, load, save_array, save_container,
};

#[tokio::test]
async fn local_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());

    let array = NpyArray::from_elements(vec![2, 2], ArrayOrder::F, &[1i32, 2, 3, 4]).unwrap();
    save_array(&backend, "nested/one.npy", &array, false).await.unwrap();
    assert!(backend.exists("nested/one.npy").await.unwrap());
    assert!(dir.path().join("nested/one.npy").is_file());

    let mut container = Container::with_options(ContainerOptions::compressed());
    container.push(array.clone()).unwrap();
    let labels = NpyArray::from_elements(vec![3], ArrayOrder::C, &[1u8, 0, 1]).unwrap();
    container.insert("labels", labels).unwrap();
    save_container(&backend, "many.npz", &container, false).await.unwrap();

    match load(&backend, "nested/one.npy").await.unwrap() {
        Loaded::Array(a) => assert_eq!(a, array),
        other => panic!("expected an array, got {other:?}"),
    }
    let loaded = load(&backend, "many.npz").await.unwrap().into_container().unwrap();
    assert_eq!(loaded, container);
    assert_eq!(loaded.get("arr_0"), Some(&array));
}

#[tokio::test]
async fn save_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    let first = NpyArray::from_elements(vec![1], ArrayOrder::C, &[1.0f32]).unwrap();
    let second = NpyArray::from_elements(vec![1], ArrayOrder::C, &[2.0f32]).unwrap();

    save_array(&backend, "x.npy", &first, false).await.unwrap();
    assert!(matches!(
        save_array(&backend, "x.npy", &second, false).await,
        Err(NpzError::AlreadyExists(_))
    ));
    assert_eq!(load(&backend, "x.npy").await.unwrap().into_array(), Some(first));

    save_array(&backend, "x.npy", &second, true).await.unwrap();
    assert_eq!(load(&backend, "x.npy").await.unwrap().into_array(), Some(second));
}

#[tokio::test]
async fn missing_and_corrupt_objects() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(dir.path());
    assert!(!backend.exists("nope.npz").await.unwrap());
    assert!(matches!(
        load(&backend, "nope.npz").await,
        Err(NpzError::NotFound(_))
    ));

    std::fs::write(dir.path().join("junk.npz"), b"definitely not an archive").unwrap();
    assert!(matches!(
        load(&backend, "junk.npz").await,
        Err(NpzError::MalformedArchive { .. })
    ));
}
