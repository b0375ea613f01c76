//! Movie persistence, the demo collaborator served behind the audit middleware
//!
//! [`MovieStore`] is chosen once at startup: [`PgMovieStore`] calls the
//! `demo.create_movie` stored function, [`MemoryMovieStore`] keeps movies in
//! process. The HTTP surface is [`routes`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Row, Statement};

use crate::error::{DatabaseError, DatabaseOperation, Error, Op, Result};
use crate::ids::RequestId;

const OP_STORE: Op = "movie/PgMovieStore.store";
const OP_INITIALIZE: Op = "movie/PgMovieStore.initialize";

const CREATE_MOVIE_SQL: &str = r#"
select o_create_timestamp,
       o_update_timestamp
  from demo.create_movie (
    p_title => $1,
    p_year => $2,
    p_rated => $3,
    p_released => $4,
    p_run_time => $5,
    p_director => $6,
    p_writer => $7,
    p_create_client_id => $8,
    p_create_user_id => $9)
"#;

/// Header carrying the caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// A movie as accepted by `POST /api/v1/movies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub title: String,
    pub year: i32,
    pub rated: String,
    pub released: NaiveDate,
    /// Minutes
    pub run_time: i32,
    pub director: String,
    pub writer: String,
}

impl Movie {
    /// Reject movies that cannot be stored
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::BadRequest("title is required".to_string()));
        }
        if self.year < 1878 {
            return Err(Error::BadRequest(
                "year must be 1878 or later".to_string(),
            ));
        }
        if self.run_time <= 0 {
            return Err(Error::BadRequest("run_time must be positive".to_string()));
        }
        if self.director.trim().is_empty() {
            return Err(Error::BadRequest("director is required".to_string()));
        }
        Ok(())
    }
}

/// Who created a row and when
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditTrail {
    pub create_client_id: String,
    pub create_user_id: String,
    pub create_timestamp: Option<DateTime<Utc>>,
    pub update_timestamp: Option<DateTime<Utc>>,
}

impl AuditTrail {
    /// Trail for a row about to be created
    pub fn new(create_client_id: impl Into<String>, create_user_id: impl Into<String>) -> Self {
        Self {
            create_client_id: create_client_id.into(),
            create_user_id: create_user_id.into(),
            ..Self::default()
        }
    }
}

/// Persistence for movies
#[async_trait]
pub trait MovieStore: Send + Sync {
    /// Store `movie` and fill in the trail's create/update timestamps
    async fn store(&self, movie: &Movie, trail: &mut AuditTrail) -> Result<()>;
}

/// PostgreSQL movie store backed by `demo.create_movie`
#[derive(Debug, Clone)]
pub struct PgMovieStore {
    pool: PgPool,
}

impl PgMovieStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `demo` schema, `demo.movie` table and `demo.create_movie`
    /// function if they are missing
    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            "CREATE SCHEMA IF NOT EXISTS demo",
            r#"
            CREATE TABLE IF NOT EXISTS demo.movie (
                movie_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                title TEXT NOT NULL,
                year INTEGER NOT NULL,
                rated TEXT NOT NULL,
                released DATE NOT NULL,
                run_time INTEGER NOT NULL,
                director TEXT NOT NULL,
                writer TEXT NOT NULL,
                create_client_id TEXT NOT NULL,
                create_user_id TEXT NOT NULL,
                create_timestamp TIMESTAMPTZ NOT NULL,
                update_client_id TEXT NOT NULL,
                update_user_id TEXT NOT NULL,
                update_timestamp TIMESTAMPTZ NOT NULL,
                UNIQUE (title, year, director)
            )
            "#,
            r#"
            CREATE OR REPLACE FUNCTION demo.create_movie(
                p_title TEXT,
                p_year INTEGER,
                p_rated TEXT,
                p_released DATE,
                p_run_time INTEGER,
                p_director TEXT,
                p_writer TEXT,
                p_create_client_id TEXT,
                p_create_user_id TEXT,
                OUT o_create_timestamp TIMESTAMPTZ,
                OUT o_update_timestamp TIMESTAMPTZ
            )
            LANGUAGE plpgsql
            AS $$
            BEGIN
                o_create_timestamp := clock_timestamp();
                o_update_timestamp := o_create_timestamp;
                INSERT INTO demo.movie (
                    title, year, rated, released, run_time, director, writer,
                    create_client_id, create_user_id, create_timestamp,
                    update_client_id, update_user_id, update_timestamp
                ) VALUES (
                    p_title, p_year, p_rated, p_released, p_run_time, p_director, p_writer,
                    p_create_client_id, p_create_user_id, o_create_timestamp,
                    p_create_client_id, p_create_user_id, o_update_timestamp
                );
            END;
            $$
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    DatabaseError::from(e)
                        .during(DatabaseOperation::Migration)
                        .add_context(OP_INITIALIZE)
                })?;
        }

        tracing::info!("Movie schema initialized");
        Ok(())
    }
}

fn tagged(operation: DatabaseOperation) -> impl Fn(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::from(e).during(operation).add_context(OP_STORE))
}

#[async_trait]
impl MovieStore for PgMovieStore {
    async fn store(&self, movie: &Movie, trail: &mut AuditTrail) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(tagged(DatabaseOperation::Begin))?;

        let statement = (&mut *tx)
            .prepare(CREATE_MOVIE_SQL)
            .await
            .map_err(tagged(DatabaseOperation::Prepare))?;

        let mut rows = statement
            .query()
            .bind(&movie.title)
            .bind(movie.year)
            .bind(&movie.rated)
            .bind(movie.released)
            .bind(movie.run_time)
            .bind(&movie.director)
            .bind(&movie.writer)
            .bind(&trail.create_client_id)
            .bind(&trail.create_user_id)
            .fetch(&mut *tx);

        let mut timestamps = None;
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(tagged(DatabaseOperation::Execute))?
        {
            let created: DateTime<Utc> = row
                .try_get("o_create_timestamp")
                .map_err(tagged(DatabaseOperation::Scan))?;
            let updated: DateTime<Utc> = row
                .try_get("o_update_timestamp")
                .map_err(tagged(DatabaseOperation::Scan))?;
            timestamps = Some((created, updated));
        }
        drop(rows);

        tx.commit().await.map_err(tagged(DatabaseOperation::Commit))?;

        if let Some((created, updated)) = timestamps {
            trail.create_timestamp = Some(created);
            trail.update_timestamp = Some(updated);
        }
        Ok(())
    }
}

/// In-process movie store
#[derive(Debug, Clone, Default)]
pub struct MemoryMovieStore {
    movies: Arc<Mutex<Vec<(Movie, AuditTrail)>>>,
}

impl MemoryMovieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything stored so far, oldest first
    pub fn movies(&self) -> Vec<(Movie, AuditTrail)> {
        self.movies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MovieStore for MemoryMovieStore {
    async fn store(&self, movie: &Movie, trail: &mut AuditTrail) -> Result<()> {
        let now = Utc::now();
        trail.create_timestamp = Some(now);
        trail.update_timestamp = Some(now);

        self.movies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((movie.clone(), trail.clone()));
        Ok(())
    }
}

/// Response body for a created movie
#[derive(Debug, Serialize)]
pub struct MovieResponse {
    #[serde(flatten)]
    pub movie: Movie,
    pub audit: AuditTrail,
}

/// `POST /api/v1/movies`
///
/// The request id assigned by the audit middleware becomes the row's client id.
pub async fn create_movie(
    State(store): State<Arc<dyn MovieStore>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(movie): Json<Movie>,
) -> Result<(StatusCode, Json<MovieResponse>)> {
    movie.validate()?;

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let mut trail = AuditTrail::new(request_id.to_string(), user_id);

    store.store(&movie, &mut trail).await?;

    tracing::info!(
        request_id = %request_id,
        title = %movie.title,
        "Movie created"
    );

    Ok((
        StatusCode::CREATED,
        Json(MovieResponse {
            movie,
            audit: trail,
        }),
    ))
}

/// Movie routes bound to `store`
pub fn routes(store: Arc<dyn MovieStore>) -> Router {
    Router::new()
        .route("/api/v1/movies", post(create_movie))
        .with_state(store)
}
